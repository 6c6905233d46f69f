//! Geoawareness core: canonical airspace snapshots, denial parsing and
//! conflict resolution for flight-plan authorization.

pub mod denial;
pub mod geometry;
pub mod models;
pub mod normalize;
pub mod resolver;

pub use denial::{
    parse_denial, parse_denial_value, try_parse_denial, try_parse_denial_value, DenialError,
};
pub use geometry::{point_in_polygon, polygons_intersect, segments_intersect};
pub use models::{
    AirspaceFeature, ConflictReport, ConnectionState, ConnectionTelemetry, DenialResult,
    OperationVolume, Point, ResolutionPolicy, Ring, Snapshot, SnapshotSource, VerticalRange,
    VolumeConflict, ZoneConflict, ZoneFeature, ZoneKind, ZoneRef,
};
pub use normalize::{normalize, parse_message, NormalizeContext, NormalizeError};
pub use resolver::resolve;
