//! Authorization denial parsing.
//!
//! Extracts conflicting volume indices and geozone references from the
//! payloads produced by the authorization service. Every accepted payload is
//! first decoded into a [`DenialPayload`] variant; business logic only sees
//! the resulting [`DenialResult`].

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use thiserror::Error;

use crate::models::{DenialResult, ZoneKind, ZoneRef};
use crate::normalize::{first_of, ring_from_value, string_of};

#[derive(Debug, Error)]
pub enum DenialError {
    #[error("Invalid denial JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unrecognized denial shape")]
    UnrecognizedShape,
}

/// Accepted denial shapes.
#[derive(Debug)]
enum DenialPayload {
    /// Plan withdrawn, typically for leaving the service volume
    Withdrawn { reason: Option<String> },
    /// Structured per-volume and/or per-geozone verdict
    Structured {
        volumes: Option<VolumeList>,
        geozones: Vec<ZoneRef>,
    },
}

#[derive(Debug)]
enum VolumeList {
    Indices(Vec<u32>),
    Statuses(Vec<VolumeStatus>),
}

#[derive(Debug)]
struct VolumeStatus {
    ordinal: u32,
    status: String,
}

const GEOZONE_BLOCK_KEYS: &[&str] = &["geozones_information", "geozonesInformation"];
const GEOZONE_LIST_KEYS: &[&str] = &[
    "conflicting_geozones",
    "conflictingGeozones",
    "geozones",
    "features",
];

fn index_list_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\[\s*(\d+(?:\s*,\s*\d+)*)\s*\]").expect("index list pattern is valid")
    })
}

/// Parse a denial payload, never failing.
///
/// Any error is logged and yields the empty result.
pub fn parse_denial(payload: &str) -> DenialResult {
    match try_parse_denial(payload) {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!("Denial payload not understood: {}", err);
            DenialResult::default()
        }
    }
}

/// Parse an already-decoded denial payload, never failing.
pub fn parse_denial_value(payload: &Value) -> DenialResult {
    match try_parse_denial_value(payload) {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!("Denial payload not understood: {}", err);
            DenialResult::default()
        }
    }
}

/// Parse a denial payload, distinguishing failures from empty denials.
pub fn try_parse_denial(payload: &str) -> Result<DenialResult, DenialError> {
    let value: Value = serde_json::from_str(payload)?;
    try_parse_denial_value(&value)
}

pub fn try_parse_denial_value(payload: &Value) -> Result<DenialResult, DenialError> {
    Ok(into_result(decode(payload)?))
}

fn decode(value: &Value) -> Result<DenialPayload, DenialError> {
    match value {
        // Double-encoded payloads arrive as a JSON string
        Value::String(text) => {
            let inner: Value = serde_json::from_str(text)?;
            match inner {
                Value::Object(object) => decode_object(&object),
                _ => Err(DenialError::UnrecognizedShape),
            }
        }
        Value::Object(object) => decode_object(object),
        _ => Err(DenialError::UnrecognizedShape),
    }
}

fn decode_object(object: &Map<String, Value>) -> Result<DenialPayload, DenialError> {
    if is_withdrawn(object) {
        return Ok(DenialPayload::Withdrawn {
            reason: withdrawn_reason(object),
        });
    }

    let volumes = object
        .get("volumes")
        .and_then(Value::as_array)
        .map(|entries| volume_list(entries));
    let geozones = first_of(object, GEOZONE_BLOCK_KEYS).map(zone_refs);

    if volumes.is_none() && geozones.is_none() {
        // Some services nest the verdict under `message`
        return match object.get("message").map(embedded_object) {
            Some(Some(inner)) => decode_object(&inner),
            _ => Err(DenialError::UnrecognizedShape),
        };
    }

    Ok(DenialPayload::Structured {
        volumes,
        geozones: geozones.unwrap_or_default(),
    })
}

fn into_result(payload: DenialPayload) -> DenialResult {
    match payload {
        DenialPayload::Withdrawn { reason } => DenialResult {
            explicit_conflict_indices: reason
                .as_deref()
                .map(indices_from_reason)
                .unwrap_or_default(),
            conflicting_zone_refs: Vec::new(),
            withdrawn_reason: reason,
        },
        DenialPayload::Structured { volumes, geozones } => {
            let explicit_conflict_indices = match volumes {
                Some(VolumeList::Indices(indices)) => indices.into_iter().collect(),
                Some(VolumeList::Statuses(statuses)) => statuses
                    .into_iter()
                    .filter(|entry| entry.status.eq_ignore_ascii_case("conflicting"))
                    .map(|entry| entry.ordinal)
                    .collect(),
                None => BTreeSet::new(),
            };
            DenialResult {
                explicit_conflict_indices,
                conflicting_zone_refs: geozones,
                withdrawn_reason: None,
            }
        }
    }
}

/// Every integer inside bracketed, comma-separated lists in the reason.
pub fn indices_from_reason(reason: &str) -> BTreeSet<u32> {
    index_list_pattern()
        .captures_iter(reason)
        .filter_map(|captures| captures.get(1))
        .flat_map(|list| {
            list.as_str()
                .split(',')
                .filter_map(|item| item.trim().parse::<u32>().ok())
                .collect::<Vec<_>>()
        })
        .collect()
}

fn is_withdrawn(object: &Map<String, Value>) -> bool {
    let status_withdrawn = string_of(object, &["status", "state"])
        .is_some_and(|status| status.eq_ignore_ascii_case("withdrawn"));
    if status_withdrawn {
        return true;
    }
    // Without an explicit status, structured fields win over free text.
    if object.contains_key("volumes") || first_of(object, GEOZONE_BLOCK_KEYS).is_some() {
        return false;
    }
    withdrawn_reason(object).is_some_and(|reason| {
        let lowered = reason.to_ascii_lowercase();
        lowered
            .find("outside")
            .is_some_and(|at| lowered[at..].contains("service volume"))
    })
}

fn withdrawn_reason(object: &Map<String, Value>) -> Option<String> {
    if let Some(message) = object.get("message") {
        if let Some(inner) = embedded_object(message) {
            if let Some(reason) = string_of(&inner, &["reason", "message", "detail"]) {
                return Some(reason);
            }
        } else if let Some(text) = message.as_str().map(str::trim).filter(|text| !text.is_empty()) {
            return Some(text.to_string());
        }
    }
    string_of(object, &["reason", "detail"])
}

/// An object value, or a string holding a JSON-encoded object.
fn embedded_object(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(object) => Some(object.clone()),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(object)) => Some(object),
            _ => None,
        },
        _ => None,
    }
}

fn volume_list(entries: &[Value]) -> VolumeList {
    if entries.first().is_some_and(Value::is_number) {
        return VolumeList::Indices(
            entries
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(|index| u32::try_from(index).ok())
                .collect(),
        );
    }

    VolumeList::Statuses(
        entries
            .iter()
            .filter_map(Value::as_object)
            .filter_map(|entry| {
                let ordinal = first_of(entry, &["ordinal", "index"])
                    .and_then(Value::as_u64)
                    .and_then(|ordinal| u32::try_from(ordinal).ok())?;
                let status = string_of(entry, &["status"])?;
                Some(VolumeStatus { ordinal, status })
            })
            .collect(),
    )
}

fn zone_refs(block: &Value) -> Vec<ZoneRef> {
    let block = match block {
        Value::String(_) => match embedded_object(block) {
            Some(object) => Value::Object(object),
            None => return Vec::new(),
        },
        other => other.clone(),
    };

    let entries: Vec<Value> = match &block {
        Value::Array(entries) => entries.clone(),
        Value::Object(object) => match first_of(object, GEOZONE_LIST_KEYS) {
            Some(Value::Array(entries)) => entries.clone(),
            _ if string_of(object, &["identifier", "id"]).is_some() => vec![block.clone()],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    entries.iter().filter_map(zone_ref).collect()
}

fn zone_ref(entry: &Value) -> Option<ZoneRef> {
    let object = match entry {
        Value::String(identifier) if !identifier.trim().is_empty() => {
            return Some(ZoneRef {
                identifier: identifier.trim().to_string(),
                inline_geometry: None,
                kind: None,
                info: None,
            });
        }
        Value::Object(object) => object,
        _ => return None,
    };

    let properties = object
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(object);
    let identifier = string_of(properties, &["identifier", "id", "name"])
        .or_else(|| string_of(object, &["identifier", "id"]))?;
    let inline_geometry = first_of(object, &["geometry", "ring", "polygon", "coordinates"])
        .and_then(ring_from_value);

    Some(ZoneRef {
        identifier,
        inline_geometry,
        kind: string_of(properties, &["type", "kind", "zone_type"])
            .map(|label| ZoneKind::from_label(&label)),
        info: string_of(properties, &["info", "message", "reason"]),
    })
}
