//! Normalization of geoawareness feed messages into canonical snapshots.
//!
//! The feed delivers either a control envelope carrying a zone feature
//! collection and an optional airspace boundary, or a flat legacy list of
//! zone objects. Already-canonical snapshots are accepted too, so a
//! serialized [`Snapshot`] normalizes back to itself.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::models::{
    AirspaceFeature, Point, Ring, Snapshot, SnapshotSource, VerticalRange, ZoneFeature, ZoneKind,
};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unrecognized message shape")]
    UnrecognizedShape,
}

/// Defaults applied where the message is silent.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    /// Space identifier used when the message carries none
    pub space_id: String,
    /// Receive time used when the message carries no timestamp
    pub received_at: DateTime<Utc>,
    pub source: SnapshotSource,
}

impl NormalizeContext {
    pub fn live(space_id: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            space_id: space_id.into(),
            received_at,
            source: SnapshotSource::Live,
        }
    }

    pub fn fallback(space_id: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            space_id: space_id.into(),
            received_at,
            source: SnapshotSource::Fallback,
        }
    }
}

/// Top-level message shapes, decided once at the boundary.
enum WireMessage<'a> {
    /// Control block plus zone collection and optional airspace boundary
    Envelope(&'a Map<String, Value>),
    /// A serialized canonical snapshot
    Canonical(&'a Map<String, Value>),
    /// Flat list of zone objects, optionally inside a `zones` object
    Legacy {
        zones: &'a [Value],
        header: Option<&'a Map<String, Value>>,
    },
}

const ZONE_CONSUMED_KEYS: &[&str] = &[
    "identifier",
    "id",
    "type",
    "kind",
    "zone_type",
    "zoneType",
    "geometry",
    "ring",
    "polygon",
    "coordinates",
    "lower_limit",
    "lowerLimit",
    "lowerMeters",
    "lower_meters",
    "upper_limit",
    "upperLimit",
    "upperMeters",
    "upper_meters",
    "verticalRange",
    "vertical_range",
    "attributes",
];

/// Parse a raw feed message and normalize it.
pub fn parse_message(text: &str, ctx: &NormalizeContext) -> Result<Snapshot, NormalizeError> {
    let value: Value = serde_json::from_str(text)?;
    normalize(&value, ctx)
}

/// Normalize an already-decoded feed message.
///
/// Fails only when the top-level shape is not recognized. Malformed zone
/// entries are skipped individually.
pub fn normalize(value: &Value, ctx: &NormalizeContext) -> Result<Snapshot, NormalizeError> {
    let message = classify(value).ok_or(NormalizeError::UnrecognizedShape)?;

    let snapshot = match message {
        WireMessage::Envelope(object) => {
            let control = object.get("control").and_then(Value::as_object);
            let zones = first_of(object, &["geozones", "geozone_collection", "geozoneCollection", "zones"]);
            let airspace = first_of(object, &["airspace", "airspace_boundary", "airspaceBoundary"]);
            Snapshot {
                space_id: control
                    .and_then(|control| string_of(control, &["spaceId", "space_id"]))
                    .unwrap_or_else(|| ctx.space_id.clone()),
                observed_at: control
                    .and_then(|control| first_of(control, &["timestamp", "observedAt", "observed_at"]))
                    .and_then(parse_timestamp)
                    .unwrap_or(ctx.received_at),
                airspace: airspace.and_then(airspace_from_value),
                restricted_zones: zones_from_entries(zone_entries(zones)),
                source: ctx.source,
            }
        }
        WireMessage::Canonical(object) => Snapshot {
            space_id: string_of(object, &["spaceId", "space_id"])
                .unwrap_or_else(|| ctx.space_id.clone()),
            observed_at: first_of(object, &["observedAt", "observed_at", "timestamp"])
                .and_then(parse_timestamp)
                .unwrap_or(ctx.received_at),
            airspace: object.get("airspace").and_then(airspace_from_value),
            restricted_zones: zones_from_entries(zone_entries(first_of(
                object,
                &["restrictedZones", "restricted_zones"],
            ))),
            source: ctx.source,
        },
        WireMessage::Legacy { zones, header } => Snapshot {
            space_id: header
                .and_then(|header| string_of(header, &["spaceId", "space_id"]))
                .unwrap_or_else(|| ctx.space_id.clone()),
            observed_at: header
                .and_then(|header| first_of(header, &["timestamp", "observedAt", "observed_at"]))
                .and_then(parse_timestamp)
                .unwrap_or(ctx.received_at),
            airspace: None,
            restricted_zones: zones_from_entries(zones),
            source: ctx.source,
        },
    };

    Ok(snapshot)
}

fn classify(value: &Value) -> Option<WireMessage<'_>> {
    match value {
        Value::Array(zones) => Some(WireMessage::Legacy { zones, header: None }),
        Value::Object(object) => {
            if object.get("control").is_some_and(Value::is_object) {
                return Some(WireMessage::Envelope(object));
            }
            if first_of(object, &["restrictedZones", "restricted_zones"]).is_some() {
                return Some(WireMessage::Canonical(object));
            }
            if let Some(zones) = object.get("zones").and_then(Value::as_array) {
                return Some(WireMessage::Legacy {
                    zones,
                    header: Some(object),
                });
            }
            first_of(object, &["data", "payload"]).and_then(classify)
        }
        _ => None,
    }
}

fn zones_from_entries(entries: &[Value]) -> Vec<ZoneFeature> {
    let zones: Vec<ZoneFeature> = entries.iter().filter_map(zone_from_value).collect();
    if zones.len() < entries.len() {
        tracing::debug!(
            "Skipped {} malformed zone entries out of {}",
            entries.len() - zones.len(),
            entries.len()
        );
    }
    zones
}

fn zone_entries(value: Option<&Value>) -> &[Value] {
    match value {
        Some(Value::Array(entries)) => entries,
        Some(Value::Object(collection)) => collection
            .get("features")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    }
}

/// Split a zone entry into its property map and geometry, accepting both
/// GeoJSON features and flat zone objects.
fn feature_parts(object: &Map<String, Value>) -> (&Map<String, Value>, Option<&Value>) {
    match object.get("properties").and_then(Value::as_object) {
        Some(properties) => (properties, object.get("geometry")),
        None => (
            object,
            first_of(object, &["geometry", "ring", "polygon", "coordinates"]),
        ),
    }
}

fn zone_from_value(value: &Value) -> Option<ZoneFeature> {
    let object = value.as_object()?;
    let (properties, geometry) = feature_parts(object);

    let id = string_of(properties, &["identifier", "id"])
        .or_else(|| string_of(object, &["id"]))?;
    let ring = geometry.and_then(ring_from_value)?;
    let kind = string_of(properties, &["kind", "type", "zone_type", "zoneType"])
        .map(|label| ZoneKind::from_label(&label))
        .unwrap_or_default();

    Some(ZoneFeature {
        id,
        kind,
        ring,
        vertical_range: vertical_range(properties),
        attributes: attributes(properties),
    })
}

fn airspace_from_value(value: &Value) -> Option<AirspaceFeature> {
    let object = value.as_object()?;
    let (properties, geometry) = feature_parts(object);
    let ring = geometry.and_then(ring_from_value)?;

    Some(AirspaceFeature {
        id: string_of(properties, &["identifier", "id"]).or_else(|| string_of(object, &["id"])),
        ring,
        vertical_range: vertical_range(properties),
        attributes: attributes(properties),
    })
}

fn attributes(properties: &Map<String, Value>) -> BTreeMap<String, Value> {
    let mut attributes: BTreeMap<String, Value> = properties
        .iter()
        .filter(|(key, _)| !ZONE_CONSUMED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    if let Some(nested) = properties.get("attributes").and_then(Value::as_object) {
        for (key, value) in nested {
            attributes.insert(key.clone(), value.clone());
        }
    }
    attributes
}

fn vertical_range(properties: &Map<String, Value>) -> Option<VerticalRange> {
    let nested = first_of(properties, &["verticalRange", "vertical_range"]).and_then(Value::as_object);
    let source = nested.unwrap_or(properties);

    let upper = number_of(source, &["upperMeters", "upper_meters", "upper_limit", "upperLimit"])?;
    let lower = number_of(source, &["lowerMeters", "lower_meters", "lower_limit", "lowerLimit"])
        .unwrap_or(0.0);

    Some(VerticalRange {
        lower_meters: lower,
        upper_meters: upper,
    })
}

/// Extract an open ring from any of the accepted geometry encodings.
///
/// Returns `None` for unreadable coordinates or fewer than three distinct
/// vertices.
pub fn ring_from_value(value: &Value) -> Option<Ring> {
    let mut points = points_from_value(value)?;

    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }

    let ring = Ring::new(points);
    if ring.is_degenerate() {
        return None;
    }
    Some(ring)
}

fn points_from_value(value: &Value) -> Option<Vec<Point>> {
    match value {
        Value::Object(object) => {
            let coordinates = object.get("coordinates")?;
            match object.get("type").and_then(Value::as_str) {
                Some("MultiPolygon") => coordinates
                    .get(0)
                    .and_then(|polygon| polygon.get(0))
                    .and_then(points_from_value),
                _ => points_from_value(coordinates),
            }
        }
        Value::Array(items) => match items.first()? {
            Value::Array(first) if first.first().is_some_and(Value::is_number) => {
                items.iter().map(pair_point).collect()
            }
            // Nested rings: the outer ring comes first
            Value::Array(_) => points_from_value(&items[0]),
            Value::Object(_) => items.iter().map(object_point).collect(),
            _ => None,
        },
        _ => None,
    }
}

fn pair_point(value: &Value) -> Option<Point> {
    let pair = value.as_array()?;
    let lon = pair.first()?.as_f64()?;
    let lat = pair.get(1)?.as_f64()?;
    let point = Point::new(lon, lat);
    point.is_finite().then_some(point)
}

fn object_point(value: &Value) -> Option<Point> {
    let object = value.as_object()?;
    let lon = number_of(object, &["lon", "lng", "longitude"])?;
    let lat = number_of(object, &["lat", "latitude"])?;
    let point = Point::new(lon, lat);
    point.is_finite().then_some(point)
}

/// Parse an RFC 3339 string or an epoch number (seconds or milliseconds).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc))
            .or_else(|| text.trim().parse::<f64>().ok().and_then(epoch_to_datetime)),
        Value::Number(number) => number.as_f64().and_then(epoch_to_datetime),
        _ => None,
    }
}

fn epoch_to_datetime(epoch: f64) -> Option<DateTime<Utc>> {
    if !epoch.is_finite() || epoch < 0.0 {
        return None;
    }
    // Anything past 1e11 seconds is year 5138; treat it as milliseconds.
    if epoch > 1e11 {
        DateTime::from_timestamp_millis(epoch as i64)
    } else {
        DateTime::from_timestamp(epoch.trunc() as i64, (epoch.fract() * 1e9) as u32)
    }
}

pub(crate) fn first_of<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find(|value| !value.is_null())
}

pub(crate) fn string_of(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match object.get(*key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

fn number_of(object: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| match object.get(*key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    })
    .filter(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ctx() -> NormalizeContext {
        NormalizeContext::live("space-7", Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
    }

    fn square_coords() -> Value {
        json!([[[-3.70, 40.40], [-3.69, 40.40], [-3.69, 40.41], [-3.70, 40.41], [-3.70, 40.40]]])
    }

    fn envelope() -> Value {
        json!({
            "control": { "spaceId": "madrid-1", "timestamp": "2024-05-01T10:00:00Z" },
            "airspace": {
                "type": "Feature",
                "properties": { "identifier": "boundary" },
                "geometry": { "type": "Polygon", "coordinates": [[[-4.0, 40.0], [-3.0, 40.0], [-3.0, 41.0], [-4.0, 41.0]]] }
            },
            "geozones": {
                "type": "FeatureCollection",
                "features": [
                    {
                        "type": "Feature",
                        "properties": {
                            "identifier": "ZONE-A",
                            "type": "PROHIBITED",
                            "lower_limit": 0,
                            "upper_limit": 120,
                            "name": "Palace"
                        },
                        "geometry": { "type": "Polygon", "coordinates": square_coords() }
                    },
                    {
                        "type": "Feature",
                        "properties": { "identifier": "BROKEN" },
                        "geometry": { "type": "Polygon", "coordinates": [[[0.0, 0.0], [1.0, 1.0]]] }
                    }
                ]
            }
        })
    }

    fn legacy() -> Value {
        json!([
            {
                "identifier": "ZONE-A",
                "type": "PROHIBITED",
                "lowerLimit": 0,
                "upperLimit": 120,
                "name": "Palace",
                "geometry": { "type": "Polygon", "coordinates": square_coords() }
            },
            { "type": "RESTRICTED" },
            "not even an object"
        ])
    }

    #[test]
    fn envelope_shape_is_normalized() {
        let snapshot = normalize(&envelope(), &ctx()).unwrap();
        assert_eq!(snapshot.space_id, "madrid-1");
        assert_eq!(
            snapshot.observed_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(snapshot.source, SnapshotSource::Live);
        assert!(snapshot.airspace.is_some());
        assert_eq!(snapshot.restricted_zones.len(), 1);

        let zone = &snapshot.restricted_zones[0];
        assert_eq!(zone.id, "ZONE-A");
        assert_eq!(zone.kind, ZoneKind::Prohibited);
        assert_eq!(zone.ring.len(), 4);
        assert_eq!(
            zone.vertical_range,
            Some(VerticalRange { lower_meters: 0.0, upper_meters: 120.0 })
        );
        assert_eq!(zone.attributes.get("name"), Some(&json!("Palace")));
    }

    #[test]
    fn legacy_shape_skips_bad_entries_and_uses_context() {
        let snapshot = normalize(&legacy(), &ctx()).unwrap();
        assert_eq!(snapshot.space_id, "space-7");
        assert_eq!(snapshot.observed_at, ctx().received_at);
        assert_eq!(snapshot.restricted_zones.len(), 1);
        assert!(snapshot.airspace.is_none());
    }

    #[test]
    fn both_shapes_yield_the_same_zones() {
        let from_envelope = normalize(&envelope(), &ctx()).unwrap();
        let from_legacy = normalize(&legacy(), &ctx()).unwrap();
        assert_eq!(from_envelope.restricted_zones, from_legacy.restricted_zones);
    }

    #[test]
    fn canonical_snapshot_normalizes_to_itself() {
        let first = normalize(&legacy(), &ctx()).unwrap();
        let serialized = serde_json::to_value(&first).unwrap();
        let second = normalize(&serialized, &ctx()).unwrap();
        assert_eq!(first.restricted_zones, second.restricted_zones);
        assert_eq!(first, second);
    }

    #[test]
    fn fallback_body_with_zones_list() {
        let body = json!({
            "zones": [{
                "id": "TFR-9",
                "zone_type": "TFR",
                "polygon": [{ "lon": 1.0, "lat": 1.0 }, { "lng": 2.0, "lat": 1.0 }, { "lon": 2.0, "lat": 2.0 }]
            }]
        });
        let fallback = NormalizeContext::fallback("space-7", ctx().received_at);
        let snapshot = normalize(&body, &fallback).unwrap();
        assert_eq!(snapshot.source, SnapshotSource::Fallback);
        assert_eq!(snapshot.restricted_zones[0].kind, ZoneKind::Temporary);
        assert_eq!(snapshot.restricted_zones[0].ring.len(), 3);
        assert!(snapshot.restricted_zones[0].attributes.is_empty());
    }

    #[test]
    fn wrapped_message_is_unwrapped() {
        let wrapped = json!({ "type": "update", "data": envelope() });
        let snapshot = normalize(&wrapped, &ctx()).unwrap();
        assert_eq!(snapshot.space_id, "madrid-1");
    }

    #[test]
    fn missing_collections_default_to_empty() {
        let message = json!({ "control": { "space_id": "x", "timestamp": 1714557600 } });
        let snapshot = normalize(&message, &ctx()).unwrap();
        assert!(snapshot.restricted_zones.is_empty());
        assert!(snapshot.airspace.is_none());
        assert_eq!(
            snapshot.observed_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn epoch_millis_timestamps() {
        let parsed = parse_timestamp(&json!(1714557600000_i64)).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn unrecognized_and_invalid_messages_fail() {
        assert!(matches!(
            normalize(&json!({ "hello": "world" }), &ctx()),
            Err(NormalizeError::UnrecognizedShape)
        ));
        assert!(matches!(
            normalize(&json!(42), &ctx()),
            Err(NormalizeError::UnrecognizedShape)
        ));
        assert!(matches!(
            parse_message("{not json", &ctx()),
            Err(NormalizeError::Json(_))
        ));
    }
}
