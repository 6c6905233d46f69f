//! Core data models for geoawareness snapshots and denial conflicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A horizontal position. Serialized as a `[lon, lat]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Point {
    pub lon: f64,
    pub lat: f64,
}

impl Point {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    pub fn is_finite(&self) -> bool {
        self.lon.is_finite() && self.lat.is_finite()
    }
}

impl From<[f64; 2]> for Point {
    fn from(pair: [f64; 2]) -> Self {
        Self::new(pair[0], pair[1])
    }
}

impl From<Point> for [f64; 2] {
    fn from(point: Point) -> Self {
        [point.lon, point.lat]
    }
}

/// Polygon boundary as an open ring (the closing vertex is not repeated).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ring(pub Vec<Point>);

impl Ring {
    pub fn new(points: Vec<Point>) -> Self {
        Self(points)
    }

    pub fn points(&self) -> &[Point] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of distinct vertices, ignoring exact repeats.
    pub fn distinct_vertices(&self) -> usize {
        crate::geometry::distinct_vertex_count(&self.0)
    }

    /// A ring with fewer than three distinct vertices encloses no area.
    pub fn is_degenerate(&self) -> bool {
        self.distinct_vertices() < 3
    }

    /// Copy of the ring with the first vertex repeated at the end.
    pub fn closed(&self) -> Vec<Point> {
        let mut points = self.0.clone();
        if let (Some(first), Some(last)) = (points.first().copied(), points.last().copied()) {
            if first != last {
                points.push(first);
            }
        }
        points
    }
}

impl From<Vec<[f64; 2]>> for Ring {
    fn from(pairs: Vec<[f64; 2]>) -> Self {
        Self(pairs.into_iter().map(Point::from).collect())
    }
}

/// Classification of a restricted-airspace zone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    /// No flights allowed
    Prohibited,
    /// Flights allowed with authorization
    Restricted,
    /// Controlled airspace, conditional access
    Controlled,
    /// Informational only
    Advisory,
    Warning,
    /// Temporary flight restriction
    Temporary,
    #[default]
    Other,
}

impl ZoneKind {
    /// Map the labels used by the various feeds onto a zone kind.
    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "PROHIBITED" | "NO_FLY_ZONE" | "NO_FLY" => Self::Prohibited,
            "RESTRICTED" | "REQ_AUTHORISATION" | "REQ_AUTHORIZATION" | "RESTRICTED_AREA" => {
                Self::Restricted
            }
            "CONTROLLED" | "CONDITIONAL" => Self::Controlled,
            "ADVISORY" | "INFO" | "INFORMATION" => Self::Advisory,
            "WARNING" => Self::Warning,
            "TEMPORARY" | "TFR" | "TEMPORARY_RESTRICTION" => Self::Temporary,
            _ => Self::Other,
        }
    }
}

/// Vertical limits of a zone in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerticalRange {
    pub lower_meters: f64,
    pub upper_meters: f64,
}

/// A restricted zone as reported by the geoawareness feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneFeature {
    pub id: String,
    pub kind: ZoneKind,
    pub ring: Ring,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_range: Option<VerticalRange>,
    /// Opaque feed attributes carried through for display.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// Boundary of the airspace being watched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirspaceFeature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub ring: Ring,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_range: Option<VerticalRange>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    /// Delivered over the live stream
    Live,
    /// Fetched by the one-shot HTTP fallback
    Fallback,
}

/// Canonical geoawareness result for one space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub space_id: String,
    pub observed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub airspace: Option<AirspaceFeature>,
    #[serde(default)]
    pub restricted_zones: Vec<ZoneFeature>,
    pub source: SnapshotSource,
}

impl Snapshot {
    /// Look up a restricted zone by identifier.
    pub fn zone(&self, id: &str) -> Option<&ZoneFeature> {
        self.restricted_zones.iter().find(|zone| zone.id == id)
    }
}

/// One segment of a planned flight's 4-D volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationVolume {
    /// Position in the plan; when absent the list position is used.
    #[serde(default)]
    pub ordinal: Option<u32>,
    pub ring: Ring,
    #[serde(default, alias = "lower_altitude_m")]
    pub lower_altitude_meters: f64,
    #[serde(default, alias = "upper_altitude_m")]
    pub upper_altitude_meters: f64,
    #[serde(default, alias = "time_begin")]
    pub time_begin: Option<DateTime<Utc>>,
    #[serde(default, alias = "time_end")]
    pub time_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub name: Option<String>,
}

impl OperationVolume {
    /// Ordinal used for conflict matching.
    pub fn effective_ordinal(&self, position: usize) -> u32 {
        self.ordinal
            .unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX))
    }
}

/// A geozone named by a denial, possibly without geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneRef {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_geometry: Option<Ring>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ZoneKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

/// What an authorization denial says about the plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialResult {
    pub explicit_conflict_indices: BTreeSet<u32>,
    pub conflicting_zone_refs: Vec<ZoneRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawn_reason: Option<String>,
}

impl DenialResult {
    /// True when the denial carries no indices, zones or reason.
    pub fn is_empty(&self) -> bool {
        self.explicit_conflict_indices.is_empty()
            && self.conflicting_zone_refs.is_empty()
            && self.withdrawn_reason.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConflict {
    pub ordinal: u32,
    pub is_conflicting: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneConflict {
    pub identifier: String,
    pub ring: Ring,
    pub kind: ZoneKind,
}

/// Which resolution step decided the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Denial listed the conflicting volume indices
    ExplicitIndices,
    /// Volumes tested against resolved zone geometry
    GeometricOverlap,
    /// Nothing attributable; every volume flagged
    ConservativeDefault,
}

/// Conflict classification consumed by presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub volume_conflicts: Vec<VolumeConflict>,
    pub zone_conflicts: Vec<ZoneConflict>,
    pub policy: ResolutionPolicy,
}

impl ConflictReport {
    /// Ordinals of the volumes flagged as conflicting.
    pub fn conflicting_ordinals(&self) -> Vec<u32> {
        self.volume_conflicts
            .iter()
            .filter(|conflict| conflict.is_conflicting)
            .map(|conflict| conflict.ordinal)
            .collect()
    }
}

// ========== CONNECTION TELEMETRY ==========

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Connection status for status indicators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTelemetry {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub using_fallback: bool,
    pub last_message_at: Option<DateTime<Utc>>,
}
