//! Verdict types: what a detection run reports and how it is explained.

use crate::event::RoadwayEvent;
use serde::{Deserialize, Serialize};

/// The closed set of anomaly classifications. Wire names are snake_case and
/// stable; downstream repair logic switches on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    #[default]
    None,
    ZeroCoordinates,
    InvalidCoordinates,
    StuckApi,
    FutureTimestamp,
    StaleEvent,
    EventSpike,
    OutOfStateBounds,
    DuplicateIdMismatch,
    MlDetected,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ZeroCoordinates => "zero_coordinates",
            Self::InvalidCoordinates => "invalid_coordinates",
            Self::StuckApi => "stuck_api",
            Self::FutureTimestamp => "future_timestamp",
            Self::StaleEvent => "stale_event",
            Self::EventSpike => "event_spike",
            Self::OutOfStateBounds => "out_of_state_bounds",
            Self::DuplicateIdMismatch => "duplicate_id_mismatch",
            Self::MlDetected => "ml_detected",
        }
    }

    /// Human-readable explanation for ops dashboards and the alert feed.
    pub fn explain(&self, event: &RoadwayEvent) -> String {
        let state = if event.state.is_empty() {
            "unknown"
        } else {
            event.state.as_str()
        };
        match self {
            Self::None => String::new(),
            Self::ZeroCoordinates => format!(
                "Event coordinates (0, 0) indicate sensor failure for {} API",
                state
            ),
            Self::InvalidCoordinates => format!(
                "Coordinates ({}, {}) outside valid US range",
                event.latitude, event.longitude
            ),
            Self::StuckApi => {
                "API returning identical data - possible caching issue or service outage".to_string()
            }
            Self::FutureTimestamp => {
                format!("Event timestamp {} is in the future", event.timestamp)
            }
            Self::StaleEvent => {
                "Event is over 1 week old - may be incorrectly included in feed".to_string()
            }
            Self::EventSpike => format!(
                "Unusual spike in events from {} - possible data corruption",
                state
            ),
            Self::OutOfStateBounds => {
                format!("Event location doesn't match state {} geography", state)
            }
            Self::DuplicateIdMismatch => {
                format!("Event ID {} reused with different data", event.id)
            }
            Self::MlDetected => "Event deviates from learned normal patterns".to_string(),
        }
    }
}

/// Severity bands over the fused score.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    None = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            Self::Critical
        } else if score >= 0.75 {
            Self::High
        } else if score >= 0.6 {
            Self::Medium
        } else if score >= 0.4 {
            Self::Low
        } else {
            Self::None
        }
    }
}

/// Per-method scores, populated whether or not a method fired. Keeping the
/// quiet methods visible is what makes a fused verdict auditable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodScores {
    pub statistical: f64,
    pub ml: f64,
    pub pattern: f64,
}

impl MethodScores {
    pub fn max(&self) -> f64 {
        self.statistical.max(self.ml).max(self.pattern)
    }
}

/// Where a fallback plan sourced its replacement data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackSource {
    CachedCoordinates,
    SkipUpdate,
    FilteredOut,
    Interpolated,
    NoneAvailable,
}

/// What downstream consumers should do with the anomalous event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    RetainPreviousData,
    RemoveFromActiveEvents,
    ManualReviewRequired,
}

/// Self-healing plan attached to an anomalous verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackPlan {
    pub source: FallbackSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<FallbackAction>,
    pub confidence: f64,
}

impl FallbackPlan {
    pub fn cached(latitude: f64, longitude: f64, confidence: f64) -> Self {
        Self {
            source: FallbackSource::CachedCoordinates,
            latitude: Some(latitude),
            longitude: Some(longitude),
            action: None,
            confidence,
        }
    }

    pub fn skip_update(confidence: f64) -> Self {
        Self {
            source: FallbackSource::SkipUpdate,
            latitude: None,
            longitude: None,
            action: Some(FallbackAction::RetainPreviousData),
            confidence,
        }
    }

    pub fn filtered_out(confidence: f64) -> Self {
        Self {
            source: FallbackSource::FilteredOut,
            latitude: None,
            longitude: None,
            action: Some(FallbackAction::RemoveFromActiveEvents),
            confidence,
        }
    }

    pub fn interpolated(latitude: f64, longitude: f64, confidence: f64) -> Self {
        Self {
            source: FallbackSource::Interpolated,
            latitude: Some(latitude),
            longitude: Some(longitude),
            action: None,
            confidence,
        }
    }

    pub fn manual_review() -> Self {
        Self {
            source: FallbackSource::NoneAvailable,
            latitude: None,
            longitude: None,
            action: Some(FallbackAction::ManualReviewRequired),
            confidence: 0.0,
        }
    }
}

/// Fused detection result. `detect()` always produces one of these; it
/// never errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub is_anomaly: bool,
    /// Max of the method scores, rounded to three decimals.
    pub score: f64,
    pub kind: AnomalyKind,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackPlan>,
    pub method_scores: MethodScores,
    pub severity: Severity,
}

/// Round to three decimals for wire output.
pub fn round3(score: f64) -> f64 {
    (score * 1000.0).round() / 1000.0
}
