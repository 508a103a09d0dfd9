//! Bounded context windows over recent events.
//!
//! The detectors score a candidate against what the feed produced recently.
//! `ContextWindow` is the per-state ring; `WindowRegistry` keys windows by
//! state for the streaming ingest path and keeps total memory bounded by
//! evicting the state that has gone quietest.

use crate::event::RoadwayEvent;
use std::collections::{HashMap, VecDeque};

/// Default ring capacity per state.
pub const DEFAULT_WINDOW_CAPACITY: usize = 1000;

/// Default cap on distinct states a registry will track. Fifty states plus
/// DC and territories fit with slack.
pub const DEFAULT_MAX_STATES: usize = 64;

/// Fixed-capacity ring of recent events, oldest first.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    events: VecDeque<RoadwayEvent>,
    capacity: usize,
}

impl ContextWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append an event, evicting the oldest when full.
    pub fn push(&mut self, event: RoadwayEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Owned copy of the window contents, oldest to newest. The detectors
    /// take a slice, so callers clone once per detection.
    pub fn snapshot(&self) -> Vec<RoadwayEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

/// Per-state windows with a bound on how many states are tracked. When a
/// new state arrives at capacity, the least-recently-updated state is
/// dropped wholesale.
#[derive(Debug)]
pub struct WindowRegistry {
    windows: HashMap<String, ContextWindow>,
    /// States ordered by last push, least recent first.
    recency: VecDeque<String>,
    max_states: usize,
    window_capacity: usize,
    evictions: u64,
}

impl WindowRegistry {
    pub fn new(max_states: usize, window_capacity: usize) -> Self {
        Self {
            windows: HashMap::new(),
            recency: VecDeque::new(),
            max_states: max_states.max(1),
            window_capacity,
            evictions: 0,
        }
    }

    pub fn push(&mut self, event: RoadwayEvent) {
        let state = event.state.clone();
        if !self.windows.contains_key(&state) && self.windows.len() == self.max_states {
            if let Some(coldest) = self.recency.pop_front() {
                self.windows.remove(&coldest);
                self.evictions += 1;
            }
        }
        self.touch(&state);
        self.windows
            .entry(state)
            .or_insert_with(|| ContextWindow::new(self.window_capacity))
            .push(event);
    }

    /// Window contents for a state, oldest first; empty when the state is
    /// unknown.
    pub fn snapshot(&self, state: &str) -> Vec<RoadwayEvent> {
        self.windows
            .get(state)
            .map(ContextWindow::snapshot)
            .unwrap_or_default()
    }

    pub fn state_count(&self) -> usize {
        self.windows.len()
    }

    pub fn event_count(&self) -> usize {
        self.windows.values().map(ContextWindow::len).sum()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    fn touch(&mut self, state: &str) {
        if let Some(pos) = self.recency.iter().position(|s| s == state) {
            self.recency.remove(pos);
        }
        self.recency.push_back(state.to_string());
    }
}

impl Default for WindowRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STATES, DEFAULT_WINDOW_CAPACITY)
    }
}
