//! Fallback synthesis: what downstream consumers should use instead of an
//! anomalous event. Pure over (event, kind, context); the engine attaches
//! the plan to the verdict.

use crate::event::RoadwayEvent;
use crate::features::event_distance_km;
use crate::verdict::{AnomalyKind, FallbackPlan};

/// Same-state neighbors within this radius are close enough to stand in
/// for a broken location.
pub const INTERPOLATION_RADIUS_KM: f64 = 50.0;

pub const CACHED_CONFIDENCE: f64 = 0.6;
pub const SKIP_UPDATE_CONFIDENCE: f64 = 0.8;
pub const FILTERED_OUT_CONFIDENCE: f64 = 0.9;
pub const INTERPOLATED_CONFIDENCE: f64 = 0.5;

/// Build the repair plan for an anomalous event.
pub fn synthesize(
    event: &RoadwayEvent,
    kind: AnomalyKind,
    context: &[RoadwayEvent],
) -> FallbackPlan {
    match kind {
        AnomalyKind::ZeroCoordinates => {
            // Most recent same-state event that still had a fix.
            if let Some(prior) = context
                .iter()
                .rev()
                .find(|e| e.state == event.state && e.has_real_coordinates())
            {
                return FallbackPlan::cached(prior.latitude, prior.longitude, CACHED_CONFIDENCE);
            }
            interpolate(event, context)
        }
        AnomalyKind::StuckApi => FallbackPlan::skip_update(SKIP_UPDATE_CONFIDENCE),
        AnomalyKind::StaleEvent => FallbackPlan::filtered_out(FILTERED_OUT_CONFIDENCE),
        _ => interpolate(event, context),
    }
}

/// Mean position of located same-state neighbors, or manual review when
/// there are none worth averaging.
fn interpolate(event: &RoadwayEvent, context: &[RoadwayEvent]) -> FallbackPlan {
    let nearby: Vec<&RoadwayEvent> = context
        .iter()
        .filter(|e| {
            e.state == event.state && event_distance_km(e, event) < INTERPOLATION_RADIUS_KM
        })
        .collect();

    let lats: Vec<f64> = nearby
        .iter()
        .filter(|e| e.latitude != 0.0)
        .map(|e| e.latitude)
        .collect();
    let lons: Vec<f64> = nearby
        .iter()
        .filter(|e| e.longitude != 0.0)
        .map(|e| e.longitude)
        .collect();

    if lats.is_empty() || lons.is_empty() {
        return FallbackPlan::manual_review();
    }

    FallbackPlan::interpolated(mean(&lats), mean(&lons), INTERPOLATED_CONFIDENCE)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}
