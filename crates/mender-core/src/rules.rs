//! Statistical rule detector: hard checks that need no training.
//!
//! Rules are ordered; the first hit classifies the event. Later hits are
//! still collected so the engine can log multi-rule events.

use crate::event::RoadwayEvent;
use crate::verdict::AnomalyKind;
use chrono::{DateTime, Duration, Utc};
use smallvec::SmallVec;

/// Continental US bounding box, inclusive.
pub const US_LAT_BOUNDS: (f64, f64) = (24.0, 50.0);
pub const US_LON_BOUNDS: (f64, f64) = (-125.0, -65.0);

/// A feed is considered stuck when this many trailing context events share
/// identical coordinates.
pub const STUCK_RUN_LEN: usize = 5;

/// Clock skew tolerance before a timestamp counts as future.
pub const FUTURE_GRACE_HOURS: i64 = 1;

/// Events older than this should not be in an active feed.
pub const STALE_AGE_HOURS: i64 = 168;

pub const ZERO_COORDINATES_SCORE: f64 = 1.0;
pub const INVALID_COORDINATES_SCORE: f64 = 1.0;
pub const STUCK_API_SCORE: f64 = 0.9;
pub const FUTURE_TIMESTAMP_SCORE: f64 = 0.95;
pub const STALE_EVENT_SCORE: f64 = 0.8;

/// One fired rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleHit {
    pub kind: AnomalyKind,
    pub score: f64,
}

/// Run all statistical rules. Hits come back in rule order; the first one
/// is the classification, the rest are attribution detail.
pub fn evaluate(event: &RoadwayEvent, context: &[RoadwayEvent]) -> SmallVec<[RuleHit; 4]> {
    evaluate_at(event, context, Utc::now())
}

fn evaluate_at(
    event: &RoadwayEvent,
    context: &[RoadwayEvent],
    now: DateTime<Utc>,
) -> SmallVec<[RuleHit; 4]> {
    let mut hits = SmallVec::new();

    if event.latitude == 0.0 && event.longitude == 0.0 {
        hits.push(RuleHit {
            kind: AnomalyKind::ZeroCoordinates,
            score: ZERO_COORDINATES_SCORE,
        });
    } else if !within_us_bounds(event.latitude, event.longitude) {
        hits.push(RuleHit {
            kind: AnomalyKind::InvalidCoordinates,
            score: INVALID_COORDINATES_SCORE,
        });
    }

    if trailing_coordinates_stuck(context) {
        hits.push(RuleHit {
            kind: AnomalyKind::StuckApi,
            score: STUCK_API_SCORE,
        });
    }

    // Timestamp rules do not apply when the stamp is missing or garbage.
    if let Some(ts) = event.parsed_timestamp() {
        if ts > now + Duration::hours(FUTURE_GRACE_HOURS) {
            hits.push(RuleHit {
                kind: AnomalyKind::FutureTimestamp,
                score: FUTURE_TIMESTAMP_SCORE,
            });
        } else if now - ts > Duration::hours(STALE_AGE_HOURS) {
            hits.push(RuleHit {
                kind: AnomalyKind::StaleEvent,
                score: STALE_EVENT_SCORE,
            });
        }
    }

    hits
}

fn within_us_bounds(lat: f64, lon: f64) -> bool {
    US_LAT_BOUNDS.0 <= lat
        && lat <= US_LAT_BOUNDS.1
        && US_LON_BOUNDS.0 <= lon
        && lon <= US_LON_BOUNDS.1
}

/// True when the last [`STUCK_RUN_LEN`] context events all carry the same
/// coordinates: the upstream API is serving a frozen response.
fn trailing_coordinates_stuck(context: &[RoadwayEvent]) -> bool {
    if context.len() < STUCK_RUN_LEN {
        return false;
    }
    let tail = &context[context.len() - STUCK_RUN_LEN..];
    let first = (tail[0].latitude, tail[0].longitude);
    tail.iter()
        .all(|e| (e.latitude, e.longitude) == first)
}
