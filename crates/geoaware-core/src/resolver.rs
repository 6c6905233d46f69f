//! Denial conflict resolution.
//!
//! Joins a plan's operation volumes with a parsed denial and, when the
//! denial names geozones without volume indices, tests the volumes against
//! the zone geometry. Precedence is fixed:
//!
//! 1. explicit volume indices from the denial,
//! 2. overlap with resolvable geozone geometry,
//! 3. otherwise every volume is flagged.

use crate::geometry::polygons_intersect;
use crate::models::{
    ConflictReport, DenialResult, OperationVolume, ResolutionPolicy, Snapshot, VolumeConflict,
    ZoneConflict, ZoneRef,
};

/// Classify every volume and every implicated geozone.
pub fn resolve(
    volumes: &[OperationVolume],
    denial: &DenialResult,
    snapshot: Option<&Snapshot>,
) -> ConflictReport {
    let zone_conflicts = resolve_zones(&denial.conflicting_zone_refs, snapshot);

    if !denial.explicit_conflict_indices.is_empty() {
        let volume_conflicts = volumes
            .iter()
            .enumerate()
            .map(|(position, volume)| {
                let ordinal = volume.effective_ordinal(position);
                VolumeConflict {
                    ordinal,
                    is_conflicting: denial.explicit_conflict_indices.contains(&ordinal),
                }
            })
            .collect();
        return ConflictReport {
            volume_conflicts,
            zone_conflicts,
            policy: ResolutionPolicy::ExplicitIndices,
        };
    }

    if !zone_conflicts.is_empty() {
        let volume_conflicts = volumes
            .iter()
            .enumerate()
            .map(|(position, volume)| VolumeConflict {
                ordinal: volume.effective_ordinal(position),
                is_conflicting: zone_conflicts
                    .iter()
                    .any(|zone| polygons_intersect(volume.ring.points(), zone.ring.points())),
            })
            .collect();
        return ConflictReport {
            volume_conflicts,
            zone_conflicts,
            policy: ResolutionPolicy::GeometricOverlap,
        };
    }

    let volume_conflicts = volumes
        .iter()
        .enumerate()
        .map(|(position, volume)| VolumeConflict {
            ordinal: volume.effective_ordinal(position),
            is_conflicting: true,
        })
        .collect();
    ConflictReport {
        volume_conflicts,
        zone_conflicts,
        policy: ResolutionPolicy::ConservativeDefault,
    }
}

/// Resolve each ref's geometry: inline first, then the snapshot. Refs
/// without usable geometry are dropped.
fn resolve_zones(refs: &[ZoneRef], snapshot: Option<&Snapshot>) -> Vec<ZoneConflict> {
    let mut resolved: Vec<ZoneConflict> = Vec::with_capacity(refs.len());

    for zone_ref in refs {
        if resolved
            .iter()
            .any(|existing| existing.identifier == zone_ref.identifier)
        {
            continue;
        }

        let known = snapshot.and_then(|snapshot| snapshot.zone(&zone_ref.identifier));
        let ring = zone_ref
            .inline_geometry
            .as_ref()
            .filter(|ring| !ring.is_degenerate())
            .or_else(|| known.map(|zone| &zone.ring).filter(|ring| !ring.is_degenerate()));

        let Some(ring) = ring else {
            tracing::debug!("No geometry for denied geozone {}", zone_ref.identifier);
            continue;
        };

        resolved.push(ZoneConflict {
            identifier: zone_ref.identifier.clone(),
            ring: ring.clone(),
            kind: zone_ref
                .kind
                .or_else(|| known.map(|zone| zone.kind))
                .unwrap_or_default(),
        });
    }

    resolved
}
