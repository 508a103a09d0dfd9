//! Detection engine.
//!
//! Three-stage pipeline per candidate event:
//! 1. Statistical stage: hard rules over coordinates and timestamps
//! 2. Learned stage: isolation forest over scaled feature vectors
//! 3. Pattern stage: per-state baselines (spikes, bounds, duplicates)
//!
//! Verdicts fuse the three method scores and carry a fallback plan so
//! consumers never have to improvise when an event is quarantined.

use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::baseline::BaselineTable;
use crate::event::RoadwayEvent;
use crate::fallback;
use crate::features::{self, FeatureVector};
use crate::forest::{IsolationForest, TRAIN_SEED};
use crate::model::{ModelArtifact, ModelStore, StandardScaler, MODEL_TYPE, MODEL_VERSION};
use crate::pattern;
use crate::rules;
use crate::verdict::{round3, AnomalyKind, MethodScores, Severity, Verdict};

// ============================================================================
// SCORING MODEL ABSTRACTION
// ============================================================================

/// Learned stage of the pipeline. Implementations must be cheap to call
/// concurrently; the engine shares one instance across all detect calls.
pub trait ScoringModel: Send + Sync {
    fn available(&self) -> bool;
    fn score(&self, features: &FeatureVector) -> f64;
    fn is_anomalous(&self, score: f64) -> bool {
        let _ = score;
        false
    }
}

/// Scaler + forest pair produced by training.
pub struct TrainedScorer {
    scaler: StandardScaler,
    forest: IsolationForest,
}

impl TrainedScorer {
    pub fn new(scaler: StandardScaler, forest: IsolationForest) -> Self {
        Self { scaler, forest }
    }
}

impl ScoringModel for TrainedScorer {
    fn available(&self) -> bool {
        true
    }

    fn score(&self, features: &FeatureVector) -> f64 {
        self.forest.score(&self.scaler.transform(features))
    }

    fn is_anomalous(&self, score: f64) -> bool {
        self.forest.is_anomalous(score)
    }
}

/// Placeholder until the first train call. Scores nothing, flags nothing.
pub struct UntrainedScorer;

impl ScoringModel for UntrainedScorer {
    fn available(&self) -> bool {
        false
    }

    fn score(&self, _features: &FeatureVector) -> f64 {
        0.0
    }
}

// ============================================================================
// ENGINE STATE SNAPSHOT
// ============================================================================

/// Immutable snapshot swapped wholesale by train(). Detect calls clone the
/// Arc once and never observe a half-updated model.
struct EngineState {
    scorer: Box<dyn ScoringModel>,
    baselines: BaselineTable,
    training_samples: usize,
    trained_at: Option<DateTime<Utc>>,
}

impl EngineState {
    fn untrained() -> Self {
        Self {
            scorer: Box::new(UntrainedScorer),
            baselines: BaselineTable::default(),
            training_samples: 0,
            trained_at: None,
        }
    }

    fn from_artifact(artifact: ModelArtifact) -> Self {
        Self {
            scorer: Box::new(TrainedScorer::new(artifact.scaler, artifact.forest)),
            baselines: artifact.baselines,
            training_samples: artifact.training_samples,
            trained_at: Some(artifact.trained_at),
        }
    }
}

// ============================================================================
// TRAINING TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainError {
    /// Training requires at least one event.
    NoTrainingData,
}

impl std::fmt::Display for TrainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainError::NoTrainingData => write!(f, "no training data provided"),
        }
    }
}

impl std::error::Error for TrainError {}

/// Summary returned to train callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainingReport {
    pub training_samples: usize,
    pub states_profiled: usize,
    pub model_type: &'static str,
}

/// Snapshot of what the engine currently knows.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub trained: bool,
    pub model_type: Option<&'static str>,
    pub training_samples: usize,
    pub states_profiled: usize,
    pub trained_at: Option<DateTime<Utc>>,
}

// ============================================================================
// DETECTION ENGINE
// ============================================================================

pub struct DetectionEngine {
    state: RwLock<Arc<EngineState>>,
    /// Serializes train calls so the store write and the snapshot swap of
    /// one epoch are never interleaved with another's.
    train_lock: Mutex<()>,
    store: Option<ModelStore>,
}

impl DetectionEngine {
    /// Engine with no persistence. Starts untrained.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(EngineState::untrained())),
            train_lock: Mutex::new(()),
            store: None,
        }
    }

    /// Engine backed by a model store. Restores the persisted artifact when
    /// one exists; a missing or unreadable artifact leaves the engine
    /// untrained rather than failing startup.
    pub fn with_store(store: ModelStore) -> Self {
        let state = match store.load() {
            Ok(Some(artifact)) => {
                info!(
                    training_samples = artifact.training_samples,
                    trained_at = %artifact.trained_at,
                    "restored persisted model"
                );
                EngineState::from_artifact(artifact)
            }
            Ok(None) => EngineState::untrained(),
            Err(err) => {
                warn!(error = %err, "failed to load persisted model, starting untrained");
                EngineState::untrained()
            }
        };
        Self {
            state: RwLock::new(Arc::new(state)),
            train_lock: Mutex::new(()),
            store: Some(store),
        }
    }

    fn snapshot(&self) -> Arc<EngineState> {
        match self.state.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn install(&self, next: EngineState) {
        let next = Arc::new(next);
        match self.state.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Score one candidate against its context. Total: every event gets a
    /// verdict, and a clean event gets a benign one.
    pub fn detect(&self, event: &RoadwayEvent, context: &[RoadwayEvent]) -> Verdict {
        let state = self.snapshot();
        let features = features::extract(event, context);

        // Stage 1: statistical rules. The first hit classifies; extras are
        // only worth a debug line.
        let rule_hits = rules::evaluate(event, context);
        if rule_hits.len() > 1 {
            debug!(
                event_id = %event.id,
                hits = rule_hits.len(),
                "candidate tripped multiple statistical rules"
            );
        }
        let statistical = rule_hits.first().copied();

        // Stage 2: learned scorer, once trained.
        let (ml_score, ml_anomalous) = if state.scorer.available() {
            let score = state.scorer.score(&features);
            (score, state.scorer.is_anomalous(score))
        } else {
            (0.0, false)
        };

        // Stage 3: per-state pattern baselines.
        let pattern_hit = pattern::evaluate(event, context, &state.baselines);

        let method_scores = MethodScores {
            statistical: statistical.map(|h| h.score).unwrap_or(0.0),
            ml: ml_score,
            pattern: pattern_hit.map(|h| h.score).unwrap_or(0.0),
        };

        let is_anomaly = statistical.is_some() || pattern_hit.is_some() || ml_anomalous;
        let kind = if let Some(hit) = statistical {
            hit.kind
        } else if let Some(hit) = pattern_hit {
            hit.kind
        } else if ml_anomalous {
            AnomalyKind::MlDetected
        } else {
            AnomalyKind::None
        };

        let score = round3(method_scores.max());
        let explanation = if is_anomaly {
            kind.explain(event)
        } else {
            String::new()
        };
        let fallback = is_anomaly.then(|| fallback::synthesize(event, kind, context));

        Verdict {
            is_anomaly,
            score,
            kind,
            explanation,
            fallback,
            method_scores,
            severity: Severity::from_score(score),
        }
    }

    /// Rebuild the learned scorer and pattern baselines from scratch, then
    /// swap the snapshot. In-flight detect calls finish on the old model.
    pub fn train(&self, events: &[RoadwayEvent]) -> Result<TrainingReport, TrainError> {
        if events.is_empty() {
            return Err(TrainError::NoTrainingData);
        }

        // One epoch at a time: the store write and the snapshot swap below
        // must not interleave with another train call's.
        let _epoch = match self.train_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Each event is featurized against the full batch as its context.
        let raw: Vec<FeatureVector> = events
            .iter()
            .map(|event| features::extract(event, events))
            .collect();
        let scaler = StandardScaler::fit(&raw);
        let scaled = scaler.transform_all(&raw);
        let forest = IsolationForest::fit_seeded(&scaled, TRAIN_SEED);
        let baselines = BaselineTable::build(events);

        let artifact = ModelArtifact {
            version: MODEL_VERSION,
            trained_at: Utc::now(),
            training_samples: events.len(),
            scaler,
            forest,
            baselines,
        };

        if let Some(store) = &self.store {
            // Persistence is write-behind: a failed save costs durability,
            // not the freshly trained model.
            if let Err(err) = store.save(&artifact) {
                warn!(error = %err, "failed to persist trained model");
            }
        }

        let report = TrainingReport {
            training_samples: artifact.training_samples,
            states_profiled: artifact.baselines.len(),
            model_type: MODEL_TYPE,
        };
        info!(
            training_samples = report.training_samples,
            states_profiled = report.states_profiled,
            "model trained"
        );
        self.install(EngineState::from_artifact(artifact));
        Ok(report)
    }

    pub fn is_trained(&self) -> bool {
        self.snapshot().scorer.available()
    }

    pub fn model_info(&self) -> ModelInfo {
        let state = self.snapshot();
        let trained = state.scorer.available();
        ModelInfo {
            trained,
            model_type: trained.then_some(MODEL_TYPE),
            training_samples: state.training_samples,
            states_profiled: state.baselines.len(),
            trained_at: state.trained_at,
        }
    }
}

impl Default for DetectionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::{FallbackAction, FallbackSource};
    use chrono::Duration;
    use serde_json::Map;

    fn recent_timestamp(hours_ago: i64) -> String {
        (Utc::now() - Duration::hours(hours_ago)).to_rfc3339()
    }

    fn event(id: &str, state: &str, lat: f64, lon: f64) -> RoadwayEvent {
        RoadwayEvent {
            id: id.to_string(),
            state: state.to_string(),
            event_type: "incident".to_string(),
            latitude: lat,
            longitude: lon,
            timestamp: recent_timestamp(1),
            description: None,
            attributes: Map::new(),
        }
    }

    /// Spread of plausible Iowa events around Des Moines.
    fn iowa_batch(count: usize) -> Vec<RoadwayEvent> {
        (0..count)
            .map(|i| {
                let lat = 41.5 + (i % 10) as f64 * 0.05;
                let lon = -93.8 + (i / 10) as f64 * 0.07;
                let mut e = event(&format!("ia-{i}"), "IA", lat, lon);
                e.timestamp = recent_timestamp((i % 24) as i64);
                e
            })
            .collect()
    }

    #[test]
    fn test_untrained_clean_event_is_benign() {
        let engine = DetectionEngine::new();
        let verdict = engine.detect(&event("e1", "IA", 41.6, -93.6), &[]);

        assert!(!verdict.is_anomaly);
        assert_eq!(verdict.score, 0.0);
        assert_eq!(verdict.kind, AnomalyKind::None);
        assert!(verdict.explanation.is_empty());
        assert!(verdict.fallback.is_none());
        assert_eq!(verdict.severity, Severity::None);
        assert_eq!(verdict.method_scores.ml, 0.0);
    }

    #[test]
    fn test_zero_coordinates_verdict_with_cached_fallback() {
        let engine = DetectionEngine::new();
        let context = vec![
            event("c1", "IA", 41.0, -94.0),
            event("c2", "IA", 42.0, -93.5),
        ];
        let verdict = engine.detect(&event("e1", "IA", 0.0, 0.0), &context);

        assert!(verdict.is_anomaly);
        assert_eq!(verdict.kind, AnomalyKind::ZeroCoordinates);
        assert_eq!(verdict.score, 1.0);
        assert_eq!(verdict.severity, Severity::Critical);
        assert!(verdict.explanation.contains("(0, 0)"));

        let plan = verdict.fallback.expect("anomaly carries a plan");
        assert_eq!(plan.source, FallbackSource::CachedCoordinates);
        assert_eq!(plan.latitude, Some(42.0));
        assert_eq!(plan.longitude, Some(-93.5));
    }

    #[test]
    fn test_statistical_outranks_pattern_for_kind() {
        let engine = DetectionEngine::new();
        // Context holds the same id with different content, so the pattern
        // stage fires too; classification still follows the rule hit.
        let mut twin = event("e1", "IA", 41.6, -93.6);
        twin.description = Some("older text".to_string());
        let context = vec![twin];

        let verdict = engine.detect(&event("e1", "IA", 0.0, 0.0), &context);
        assert!(verdict.is_anomaly);
        assert_eq!(verdict.kind, AnomalyKind::ZeroCoordinates);
        assert_eq!(verdict.method_scores.statistical, 1.0);
        assert_eq!(verdict.method_scores.pattern, 0.85);
        // Fused score is the max across methods.
        assert_eq!(verdict.score, 1.0);
    }

    #[test]
    fn test_train_on_empty_batch_fails() {
        let engine = DetectionEngine::new();
        assert_eq!(engine.train(&[]), Err(TrainError::NoTrainingData));
        assert!(!engine.is_trained());
    }

    #[test]
    fn test_train_reports_and_flips_model_info() {
        let engine = DetectionEngine::new();
        let info = engine.model_info();
        assert!(!info.trained);
        assert_eq!(info.model_type, None);

        let report = engine.train(&iowa_batch(60)).unwrap();
        assert_eq!(report.training_samples, 60);
        assert_eq!(report.states_profiled, 1);
        assert_eq!(report.model_type, "IsolationForest");

        let info = engine.model_info();
        assert!(info.trained);
        assert_eq!(info.model_type, Some("IsolationForest"));
        assert_eq!(info.training_samples, 60);
        assert_eq!(info.states_profiled, 1);
        assert!(info.trained_at.is_some());
    }

    #[test]
    fn test_trained_engine_scores_with_forest() {
        let engine = DetectionEngine::new();
        engine.train(&iowa_batch(80)).unwrap();

        let verdict = engine.detect(&event("e1", "IA", 41.6, -93.6), &[]);
        // The learned stage now produces a real score even for clean events.
        assert!(verdict.method_scores.ml > 0.0);
        assert!(verdict.method_scores.ml <= 1.0);
    }

    #[test]
    fn test_pattern_bounds_fire_after_training() {
        let engine = DetectionEngine::new();
        engine.train(&iowa_batch(60)).unwrap();

        // Valid US coordinates, but far outside Iowa's profiled ranges.
        let verdict = engine.detect(&event("e1", "IA", 47.5, -110.0), &[]);
        assert!(verdict.is_anomaly);
        assert_eq!(verdict.kind, AnomalyKind::OutOfStateBounds);
        assert_eq!(verdict.method_scores.pattern, 0.75);
        // Fused score is at least the pattern score, whatever the forest says.
        assert!(verdict.score >= 0.75);
        assert!(matches!(verdict.severity, Severity::High | Severity::Critical));
    }

    #[test]
    fn test_stale_event_gets_filtered_out_plan() {
        let engine = DetectionEngine::new();
        let mut old = event("e1", "IA", 41.6, -93.6);
        old.timestamp = recent_timestamp(24 * 30);

        let verdict = engine.detect(&old, &[]);
        assert!(verdict.is_anomaly);
        assert_eq!(verdict.kind, AnomalyKind::StaleEvent);
        let plan = verdict.fallback.unwrap();
        assert_eq!(plan.source, FallbackSource::FilteredOut);
        assert_eq!(plan.action, Some(FallbackAction::RemoveFromActiveEvents));
    }

    #[test]
    fn test_store_restores_trained_model() {
        let path = std::env::temp_dir().join(format!("mender-engine-{}.bin", uuid::Uuid::new_v4()));
        let trained = {
            let engine = DetectionEngine::with_store(ModelStore::new(&path));
            assert!(!engine.is_trained());
            engine.train(&iowa_batch(60)).unwrap();
            engine.model_info()
        };

        let restored = DetectionEngine::with_store(ModelStore::new(&path));
        assert!(restored.is_trained());
        let info = restored.model_info();
        assert_eq!(info.training_samples, trained.training_samples);
        assert_eq!(info.states_profiled, 1);
        assert_eq!(info.trained_at, trained.trained_at);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_concurrent_trainers_keep_store_and_snapshot_in_step() {
        let path = std::env::temp_dir().join(format!("mender-epochs-{}.bin", uuid::Uuid::new_v4()));
        let engine = Arc::new(DetectionEngine::with_store(ModelStore::new(&path)));

        // Racing trainers with distinguishable batch sizes. Whichever epoch
        // wins, the persisted artifact and the live snapshot must agree.
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    engine.train(&iowa_batch(40 + i)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stored = ModelStore::new(&path)
            .load()
            .unwrap()
            .expect("an artifact was persisted");
        let info = engine.model_info();
        assert_eq!(stored.training_samples, info.training_samples);
        assert_eq!(Some(stored.trained_at), info.trained_at);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_detect_is_total_for_garbage_input() {
        let engine = DetectionEngine::new();
        let mut garbage = event("", "", f64::NAN, f64::INFINITY);
        garbage.timestamp = "not a timestamp".to_string();
        garbage.event_type = String::new();

        // Must produce a verdict, never panic.
        let verdict = engine.detect(&garbage, &[]);
        assert!(verdict.is_anomaly); // NaN latitude fails the US bounds check
        assert_eq!(verdict.kind, AnomalyKind::InvalidCoordinates);
    }
}
