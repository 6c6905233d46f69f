//! Input loading and output formatting shared by the binaries.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::fs;
use std::io::Read;
use std::path::Path;

use geoaware_client::ClientEvent;
use geoaware_core::{
    normalize, ConflictReport, ConnectionTelemetry, NormalizeContext, OperationVolume, Snapshot,
};

/// Read a file, or stdin when `path` is `-`.
pub fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        return Ok(text);
    }
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

pub fn parse_volumes(text: &str) -> Result<Vec<OperationVolume>> {
    let value: Value = serde_json::from_str(text).context("Volumes file is not valid JSON")?;
    // Either a bare list or a plan object carrying one
    let list = match value {
        Value::Object(mut plan) => plan
            .remove("operationVolumes")
            .or_else(|| plan.remove("operation_volumes"))
            .or_else(|| plan.remove("volumes"))
            .context("Plan object has no volume list")?,
        other => other,
    };
    serde_json::from_value(list).context("Failed to decode operation volumes")
}

/// Accepts a canonical snapshot or any message shape the live feed sends.
pub fn parse_snapshot(text: &str, space_id: &str) -> Result<Snapshot> {
    let value: Value = serde_json::from_str(text).context("Snapshot file is not valid JSON")?;
    normalize(&value, &NormalizeContext::live(space_id, Utc::now()))
        .context("Snapshot file has no recognizable zone list")
}

/// JSON document printed by `resolve_denial`.
pub fn report_document(report: &ConflictReport, withdrawn_reason: Option<&str>) -> Value {
    json!({
        "policy": report.policy,
        "conflictingOrdinals": report.conflicting_ordinals(),
        "withdrawnReason": withdrawn_reason,
        "volumeConflicts": report.volume_conflicts,
        "zoneConflicts": report.zone_conflicts,
    })
}

pub fn describe_telemetry(telemetry: &ConnectionTelemetry) -> String {
    let mut line = format!(
        "state={:?} retries={}",
        telemetry.state, telemetry.retry_count
    );
    if telemetry.using_fallback {
        line.push_str(" fallback");
    }
    if let Some(err) = &telemetry.last_error {
        line.push_str(&format!(" last_error=\"{}\"", err));
    }
    line
}

/// One output line per client event.
pub fn describe_event(event: &ClientEvent) -> String {
    match event {
        ClientEvent::Snapshot(snapshot) => {
            let zones = snapshot
                .restricted_zones
                .iter()
                .map(|zone| zone.id.as_str())
                .collect::<Vec<_>>()
                .join(",");
            format!(
                "snapshot space={} source={:?} observed_at={} zones={} [{}]",
                snapshot.space_id,
                snapshot.source,
                snapshot.observed_at.to_rfc3339(),
                snapshot.restricted_zones.len(),
                zones
            )
        }
        ClientEvent::Telemetry(telemetry) => {
            format!("telemetry {}", describe_telemetry(telemetry))
        }
        ClientEvent::Error(err) => format!("error {}", err),
    }
}
