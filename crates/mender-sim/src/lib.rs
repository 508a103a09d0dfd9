//! Feed simulator for the Roadmender Sentinel.
//!
//! Generates plausible state-DOT roadway events with controlled fault
//! injection and ground-truth labels, so detection quality can be measured
//! against a known answer key.

use chrono::{Duration, Utc};
use mender_core::RoadwayEvent;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use serde_json::{json, Map};
use uuid::Uuid;

/// Coverage area centroids, roughly the midwest 511 network.
pub const STATE_CENTERS: &[(&str, f64, f64)] = &[
    ("IA", 41.9, -93.6),
    ("NE", 41.3, -96.1),
    ("KS", 38.5, -96.8),
    ("MO", 38.6, -92.2),
    ("MN", 45.0, -93.3),
    ("IL", 40.0, -89.0),
    ("WI", 44.5, -89.8),
    ("SD", 44.4, -100.2),
];

pub const EVENT_TYPES: &[&str] = &["construction", "incident", "weather", "special_event"];

const ROUTES: &[&str] = &["I-80", "I-35", "I-29", "I-90", "US-30", "US-20", "US-75"];

const DESCRIPTIONS: &[&str] = &[
    "Lane closure for bridge deck repair",
    "Multi-vehicle collision, right shoulder blocked",
    "Snow and ice covering the roadway",
    "Shoulder work, mobile operation",
    "Stalled vehicle blocking left lane",
    "Resurfacing project, expect delays",
    "Dense fog reducing visibility",
    "Wide load convoy moving eastbound",
];

/// Feed faults the factory can inject. Each corrupts one property a real
/// upstream outage has been observed to corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedFault {
    ZeroCoordinates,
    InvalidCoordinates,
    FutureTimestamp,
    StaleTimestamp,
    DuplicateIdMismatch,
    OutOfStateBounds,
}

impl FeedFault {
    pub const ALL: &'static [FeedFault] = &[
        FeedFault::ZeroCoordinates,
        FeedFault::InvalidCoordinates,
        FeedFault::FutureTimestamp,
        FeedFault::StaleTimestamp,
        FeedFault::DuplicateIdMismatch,
        FeedFault::OutOfStateBounds,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FeedFault::ZeroCoordinates => "zero_coordinates",
            FeedFault::InvalidCoordinates => "invalid_coordinates",
            FeedFault::FutureTimestamp => "future_timestamp",
            FeedFault::StaleTimestamp => "stale_timestamp",
            FeedFault::DuplicateIdMismatch => "duplicate_id_mismatch",
            FeedFault::OutOfStateBounds => "out_of_state_bounds",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }
}

/// A generated event plus its ground-truth label.
#[derive(Debug, Clone, Serialize)]
pub struct LabeledEvent {
    pub event: RoadwayEvent,
    pub fault: Option<FeedFault>,
}

pub struct EventFactory {
    rng: StdRng,
    scatter: Normal<f64>,
    recent_ids: Vec<String>,
}

impl EventFactory {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            scatter: Normal::new(0.0, 0.35).unwrap(),
            recent_ids: Vec::new(),
        }
    }

    pub fn center(state: &str) -> Option<(f64, f64)> {
        STATE_CENTERS
            .iter()
            .find(|(name, _, _)| *name == state)
            .map(|(_, lat, lon)| (*lat, *lon))
    }

    pub fn pick_state(&mut self) -> &'static str {
        STATE_CENTERS[self.rng.random_range(0..STATE_CENTERS.len())].0
    }

    /// A healthy event near the state's centroid, timestamped within the
    /// last few hours.
    pub fn clean_event(&mut self, state: &str) -> RoadwayEvent {
        let (lat0, lon0) = Self::center(state).unwrap_or((41.9, -93.6));
        let latitude = lat0 + self.scatter.sample(&mut self.rng);
        let longitude = lon0 + self.scatter.sample(&mut self.rng) * 1.4;

        let minutes_ago = self.rng.random_range(0..180);
        let timestamp = (Utc::now() - Duration::minutes(minutes_ago)).to_rfc3339();

        let event_type = self.pick_event_type();
        let description = DESCRIPTIONS[self.rng.random_range(0..DESCRIPTIONS.len())];
        let route = ROUTES[self.rng.random_range(0..ROUTES.len())];

        let id = format!("{}-{}", state.to_lowercase(), Uuid::new_v4());
        self.remember_id(&id);

        let mut attributes = Map::new();
        attributes.insert("route".to_string(), json!(route));
        attributes.insert(
            "update_count".to_string(),
            json!(self.rng.random_range(1..6)),
        );

        RoadwayEvent {
            id,
            state: state.to_string(),
            event_type: event_type.to_string(),
            latitude,
            longitude,
            timestamp,
            description: Some(description.to_string()),
            attributes,
        }
    }

    /// A clean event corrupted the way the named fault corrupts real feeds.
    pub fn faulty_event(&mut self, state: &str, fault: FeedFault) -> RoadwayEvent {
        let mut event = self.clean_event(state);
        match fault {
            FeedFault::ZeroCoordinates => {
                event.latitude = 0.0;
                event.longitude = 0.0;
            }
            FeedFault::InvalidCoordinates => {
                if self.rng.random_range(0..2) == 0 {
                    event.latitude = self.rng.random_range(52.0..70.0);
                } else {
                    event.longitude = self.rng.random_range(-160.0..-130.0);
                }
            }
            FeedFault::FutureTimestamp => {
                let hours = self.rng.random_range(2..48);
                event.timestamp = (Utc::now() + Duration::hours(hours)).to_rfc3339();
            }
            FeedFault::StaleTimestamp => {
                let hours = self.rng.random_range(200..500);
                event.timestamp = (Utc::now() - Duration::hours(hours)).to_rfc3339();
            }
            FeedFault::DuplicateIdMismatch => {
                // Reuse an id issued earlier in the stream; coordinates and
                // text already differ from the original.
                if !self.recent_ids.is_empty() {
                    let pick = self.rng.random_range(0..self.recent_ids.len());
                    event.id = self.recent_ids[pick].clone();
                }
            }
            FeedFault::OutOfStateBounds => {
                let (lat0, lon0) = Self::center(state).unwrap_or((41.9, -93.6));
                // Several degrees off-center, still inside the US envelope.
                event.latitude = (lat0 + 6.0).min(49.5);
                event.longitude = (lon0 - 12.0).max(-124.0);
            }
        }
        event
    }

    /// Mixed stream where each event carries the named fault with
    /// probability `fault_rate`.
    pub fn batch(&mut self, count: usize, fault_rate: f64) -> Vec<LabeledEvent> {
        (0..count)
            .map(|_| {
                let state = self.pick_state();
                if self.rng.random_range(0.0..1.0) < fault_rate {
                    let fault = FeedFault::ALL[self.rng.random_range(0..FeedFault::ALL.len())];
                    LabeledEvent {
                        event: self.faulty_event(state, fault),
                        fault: Some(fault),
                    }
                } else {
                    LabeledEvent {
                        event: self.clean_event(state),
                        fault: None,
                    }
                }
            })
            .collect()
    }

    /// Clean history suitable for training the sentinel.
    pub fn training_batch(&mut self, count: usize) -> Vec<RoadwayEvent> {
        (0..count)
            .map(|_| {
                let state = self.pick_state();
                self.clean_event(state)
            })
            .collect()
    }

    fn pick_event_type(&mut self) -> &'static str {
        // Construction dominates real feeds; special events are rare.
        let roll = self.rng.random_range(0.0..1.0);
        if roll < 0.40 {
            EVENT_TYPES[0]
        } else if roll < 0.70 {
            EVENT_TYPES[1]
        } else if roll < 0.92 {
            EVENT_TYPES[2]
        } else {
            EVENT_TYPES[3]
        }
    }

    fn remember_id(&mut self, id: &str) {
        self.recent_ids.push(id.to_string());
        if self.recent_ids.len() > 500 {
            self.recent_ids.remove(0);
        }
    }
}
