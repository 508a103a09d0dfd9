//! Feature extraction for the learned detector.
//!
//! Every event maps to a fixed-order numeric vector; order is part of the
//! model contract, since the scaler and forest are fit positionally. Keep
//! the layout below in sync with [`FEATURE_DIM`].

use crate::event::RoadwayEvent;
use chrono::{Datelike, Timelike};

/// Vector layout:
/// 0 latitude, 1 longitude, 2 hour, 3 weekday (Mon=0), 4 minute,
/// 5..=8 one-hot event type, 9 min km to a located context event,
/// 10 count of context events within [`NEARBY_RADIUS_KM`].
pub const FEATURE_DIM: usize = 11;

pub type FeatureVector = [f64; FEATURE_DIM];

/// Event classes that get a one-hot slot; anything else encodes as all
/// zeros.
pub const EVENT_TYPE_CLASSES: [&str; 4] = ["construction", "incident", "weather", "special_event"];

/// Sentinel distance when no context event has a usable location.
pub const FAR_AWAY_KM: f64 = 999.0;

/// Radius for the nearby-event count feature.
pub const NEARBY_RADIUS_KM: f64 = 10.0;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Distance between two events' published coordinates.
pub fn event_distance_km(a: &RoadwayEvent, b: &RoadwayEvent) -> f64 {
    haversine_km(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// Extract the feature vector for `event` against its context. Total:
/// missing or malformed fields become neutral values, never errors.
pub fn extract(event: &RoadwayEvent, context: &[RoadwayEvent]) -> FeatureVector {
    let mut features = [0.0; FEATURE_DIM];

    features[0] = event.latitude;
    features[1] = event.longitude;

    if let Some(ts) = event.parsed_timestamp() {
        features[2] = f64::from(ts.hour());
        features[3] = f64::from(ts.weekday().num_days_from_monday());
        features[4] = f64::from(ts.minute());
    }

    let event_type = event.event_type.to_lowercase();
    for (slot, class) in EVENT_TYPE_CLASSES.iter().enumerate() {
        if event_type == *class {
            features[5 + slot] = 1.0;
        }
    }

    let min_distance = context
        .iter()
        .filter(|e| e.latitude != 0.0)
        .map(|e| event_distance_km(event, e))
        .fold(f64::INFINITY, f64::min);
    features[9] = if min_distance.is_finite() {
        min_distance
    } else {
        FAR_AWAY_KM
    };

    features[10] = context
        .iter()
        .filter(|e| event_distance_km(event, e) < NEARBY_RADIUS_KM)
        .count() as f64;

    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn event_at(lat: f64, lon: f64) -> RoadwayEvent {
        RoadwayEvent {
            id: "IA-1".to_string(),
            state: "IA".to_string(),
            event_type: "construction".to_string(),
            latitude: lat,
            longitude: lon,
            timestamp: "2024-03-04T14:37:00Z".to_string(), // a Monday
            description: None,
            attributes: Map::new(),
        }
    }

    #[test]
    fn test_haversine_one_degree_latitude() {
        let d = haversine_km(41.0, -93.5, 42.0, -93.5);
        assert!(
            (d - 111.19).abs() < 0.3,
            "one degree of latitude should be ~111.2 km, got {}",
            d
        );
    }

    #[test]
    fn test_haversine_zero_for_same_point() {
        assert_eq!(haversine_km(42.0, -93.5, 42.0, -93.5), 0.0);
    }

    #[test]
    fn test_time_features_and_one_hot() {
        let features = extract(&event_at(42.0, -93.5), &[]);
        assert_eq!(features[0], 42.0);
        assert_eq!(features[1], -93.5);
        assert_eq!(features[2], 14.0, "hour");
        assert_eq!(features[3], 0.0, "2024-03-04 is a Monday");
        assert_eq!(features[4], 37.0, "minute");
        assert_eq!(
            &features[5..9],
            &[1.0, 0.0, 0.0, 0.0],
            "construction one-hot"
        );
    }

    #[test]
    fn test_unknown_event_type_encodes_all_zero() {
        let mut event = event_at(42.0, -93.5);
        event.event_type = "parade".to_string();
        let features = extract(&event, &[]);
        assert_eq!(&features[5..9], &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_garbage_timestamp_zeros_time_features() {
        let mut event = event_at(42.0, -93.5);
        event.timestamp = "yesterday-ish".to_string();
        let features = extract(&event, &[]);
        assert_eq!(&features[2..5], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_empty_context_uses_far_sentinel() {
        let features = extract(&event_at(42.0, -93.5), &[]);
        assert_eq!(features[9], FAR_AWAY_KM);
        assert_eq!(features[10], 0.0);
    }

    #[test]
    fn test_unlocated_context_excluded_from_min_distance() {
        let ghost = event_at(0.0, 0.0);
        let features = extract(&event_at(42.0, -93.5), &[ghost]);
        assert_eq!(
            features[9], FAR_AWAY_KM,
            "zero-latitude context events have no usable location"
        );
    }

    #[test]
    fn test_min_distance_and_nearby_count() {
        let near = event_at(42.01, -93.5); // ~1.1 km north
        let far = event_at(41.0, -93.5); // ~111 km south
        let features = extract(&event_at(42.0, -93.5), &[near, far]);
        assert!(
            features[9] > 1.0 && features[9] < 1.3,
            "min distance should be the near event, got {}",
            features[9]
        );
        assert_eq!(features[10], 1.0, "only the near event is within 10 km");
    }
}
