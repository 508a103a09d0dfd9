//! Per-state baselines learned at train time.
//!
//! A baseline is deliberately coarse: how many events the state contributed
//! to the training batch and the bounding box of its located events. Coarse
//! is enough to catch feeds that suddenly triple their volume or start
//! publishing coordinates from the wrong side of the country.

use crate::event::RoadwayEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bounds applied when a state never published a usable coordinate.
pub const DEFAULT_LAT_RANGE: (f64, f64) = (0.0, 90.0);
pub const DEFAULT_LON_RANGE: (f64, f64) = (-180.0, 0.0);

/// What "normal" looks like for one state's feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateBaseline {
    /// Events this state contributed to the training batch.
    pub event_count: usize,
    /// Min/max over nonzero training latitudes; `None` when the state never
    /// published one.
    pub lat_range: Option<(f64, f64)>,
    pub lon_range: Option<(f64, f64)>,
}

impl StateBaseline {
    /// Whether a coordinate falls inside the state's observed box,
    /// inclusive. Missing ranges fall back to the wide defaults.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let (lat_lo, lat_hi) = self.lat_range.unwrap_or(DEFAULT_LAT_RANGE);
        let (lon_lo, lon_hi) = self.lon_range.unwrap_or(DEFAULT_LON_RANGE);
        lat_lo <= lat && lat <= lat_hi && lon_lo <= lon && lon <= lon_hi
    }
}

/// All state baselines from one training run. Rebuilt wholesale; never
/// mutated incrementally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineTable {
    states: HashMap<String, StateBaseline>,
}

impl BaselineTable {
    /// Build baselines from a training batch. Events with an empty state
    /// code are skipped; they belong to no feed.
    pub fn build(events: &[RoadwayEvent]) -> Self {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut lats: HashMap<String, Vec<f64>> = HashMap::new();
        let mut lons: HashMap<String, Vec<f64>> = HashMap::new();

        for event in events {
            if event.state.is_empty() {
                continue;
            }
            *counts.entry(event.state.clone()).or_default() += 1;
            if event.latitude != 0.0 {
                lats.entry(event.state.clone())
                    .or_default()
                    .push(event.latitude);
            }
            if event.longitude != 0.0 {
                lons.entry(event.state.clone())
                    .or_default()
                    .push(event.longitude);
            }
        }

        let states = counts
            .into_iter()
            .map(|(state, event_count)| {
                let baseline = StateBaseline {
                    event_count,
                    lat_range: lats.get(&state).map(|v| min_max(v)),
                    lon_range: lons.get(&state).map(|v| min_max(v)),
                };
                (state, baseline)
            })
            .collect();

        Self { states }
    }

    pub fn get(&self, state: &str) -> Option<&StateBaseline> {
        self.states.get(state)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

fn min_max(values: &[f64]) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for &v in values {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    (lo, hi)
}
