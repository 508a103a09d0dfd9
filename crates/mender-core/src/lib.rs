//! Roadmender core: anomaly detection and self-healing fallbacks for
//! geotagged roadway events.
//!
//! State DOT feeds fail in recognizable ways: nulled-out coordinates,
//! caching layers replaying the same payload, timestamps that drift past
//! any plausible clock. The [`engine::DetectionEngine`] runs statistical
//! rules, an isolation forest over engineered features, and per-state
//! pattern baselines against each candidate event, then fuses the method
//! scores into one verdict. Every anomalous verdict ships with a concrete
//! fallback plan.
//!
//! [`sentinel`] wraps the engine in the HTTP service that production runs.

pub mod baseline;
pub mod engine;
pub mod event;
pub mod fallback;
pub mod features;
pub mod forest;
pub mod forward;
pub mod model;
pub mod pattern;
pub mod rules;
pub mod sentinel;
pub mod verdict;
pub mod window;

pub use engine::{DetectionEngine, TrainError, TrainingReport};
pub use event::RoadwayEvent;
pub use verdict::{AnomalyKind, FallbackPlan, MethodScores, Severity, Verdict};
