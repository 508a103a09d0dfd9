//! Roadway event model shared by the detectors, the serving layer, and the
//! feed simulator.
//!
//! Events arrive from state DOT feeds with wildly uneven quality: missing
//! coordinates, naive timestamps, attribute bags that churn on every poll.
//! Deserialization is deliberately lenient; the detectors decide what is
//! anomalous, not the parser.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attribute keys that feeds bump on every refresh. Excluded from content
/// identity so a routine re-poll does not read as a duplicate-id conflict.
pub const VOLATILE_ATTRIBUTES: &[&str] = &["update_count"];

/// A single geotagged roadway event (construction zone, incident, weather
/// closure, special event) as published by a state DOT feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoadwayEvent {
    pub id: String,
    /// Two-letter state code of the publishing feed.
    pub state: String,
    pub event_type: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    /// Raw timestamp string as published; parsed lazily.
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl RoadwayEvent {
    /// Parse the published timestamp. `None` means the stamp is absent or
    /// garbage; time-based rules then do not apply.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }

    /// Both coordinates present and nonzero. Feeds that lose their sensor
    /// fix publish literal zeros.
    pub fn has_real_coordinates(&self) -> bool {
        self.latitude != 0.0 && self.longitude != 0.0
    }

    /// Content identity for the duplicate-id rule: every field except the
    /// volatile attributes listed in [`VOLATILE_ATTRIBUTES`].
    pub fn content_matches(&self, other: &RoadwayEvent) -> bool {
        self.id == other.id
            && self.state == other.state
            && self.event_type == other.event_type
            && self.latitude == other.latitude
            && self.longitude == other.longitude
            && self.timestamp == other.timestamp
            && self.description == other.description
            && stable_attributes(&self.attributes) == stable_attributes(&other.attributes)
    }
}

fn stable_attributes(attrs: &Map<String, Value>) -> Map<String, Value> {
    attrs
        .iter()
        .filter(|(key, _)| !VOLATILE_ATTRIBUTES.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Parse a feed timestamp. Accepts RFC 3339 (with `Z` or an explicit
/// offset); a bare `YYYY-MM-DDTHH:MM:SS[.fff]` is treated as UTC, which is
/// what the feeds that omit the offset actually mean.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
