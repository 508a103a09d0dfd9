//! Pattern detector: candidate versus its state's learned baseline, plus
//! the duplicate-id check that needs no baseline at all.

use crate::baseline::BaselineTable;
use crate::event::RoadwayEvent;
use crate::rules::RuleHit;
use crate::verdict::AnomalyKind;

/// Same-state context volume beyond `multiplier x` the baseline count reads
/// as feed corruption.
pub const SPIKE_MULTIPLIER: usize = 3;

pub const EVENT_SPIKE_SCORE: f64 = 0.7;
pub const OUT_OF_STATE_BOUNDS_SCORE: f64 = 0.75;
pub const DUPLICATE_ID_MISMATCH_SCORE: f64 = 0.85;

/// Run the pattern checks in priority order, first hit wins. Spike and
/// bounds need a baseline for the event's state; the duplicate check runs
/// regardless.
pub fn evaluate(
    event: &RoadwayEvent,
    context: &[RoadwayEvent],
    baselines: &BaselineTable,
) -> Option<RuleHit> {
    if let Some(baseline) = baselines.get(&event.state) {
        let same_state = context.iter().filter(|e| e.state == event.state).count();
        if same_state > baseline.event_count * SPIKE_MULTIPLIER {
            return Some(RuleHit {
                kind: AnomalyKind::EventSpike,
                score: EVENT_SPIKE_SCORE,
            });
        }

        if !baseline.contains(event.latitude, event.longitude) {
            return Some(RuleHit {
                kind: AnomalyKind::OutOfStateBounds,
                score: OUT_OF_STATE_BOUNDS_SCORE,
            });
        }
    }

    if !event.id.is_empty() {
        if let Some(prior) = context.iter().find(|e| e.id == event.id) {
            if !prior.content_matches(event) {
                return Some(RuleHit {
                    kind: AnomalyKind::DuplicateIdMismatch,
                    score: DUPLICATE_ID_MISMATCH_SCORE,
                });
            }
        }
    }

    None
}
