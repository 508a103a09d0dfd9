//! End-to-end detection scenarios through the public engine API: realistic
//! feed histories in, fused verdicts and repair plans out.

use chrono::{Duration, Utc};
use mender_core::engine::DetectionEngine;
use mender_core::verdict::{FallbackAction, FallbackSource};
use mender_core::{AnomalyKind, RoadwayEvent, Severity};
use serde_json::{json, Map};

fn timestamp(hours_ago: i64) -> String {
    (Utc::now() - Duration::hours(hours_ago)).to_rfc3339()
}

fn event(id: &str, state: &str, lat: f64, lon: f64) -> RoadwayEvent {
    RoadwayEvent {
        id: id.to_string(),
        state: state.to_string(),
        event_type: "incident".to_string(),
        latitude: lat,
        longitude: lon,
        timestamp: timestamp(1),
        description: None,
        attributes: Map::new(),
    }
}

/// Scattered, recent, in-state Iowa history. Coordinates vary per index so
/// the stuck-feed rule never trips by accident.
fn iowa_history(count: usize) -> Vec<RoadwayEvent> {
    (0..count)
        .map(|i| {
            let mut e = event(
                &format!("ia-{i}"),
                "IA",
                41.4 + (i % 12) as f64 * 0.06,
                -94.0 + (i % 9) as f64 * 0.09,
            );
            e.timestamp = timestamp((i % 20) as i64);
            e
        })
        .collect()
}

#[test]
fn test_iowa_sensor_failure_scenario() {
    // One healthy IA event seeds the context; the next report loses its
    // fix. The verdict must both flag it and point back at the last fix.
    let engine = DetectionEngine::new();
    let context = vec![event("ia-1", "IA", 42.0, -93.5)];

    let verdict = engine.detect(&event("ia-2", "IA", 0.0, 0.0), &context);

    assert!(verdict.is_anomaly);
    assert_eq!(verdict.kind, AnomalyKind::ZeroCoordinates);
    assert_eq!(verdict.score, 1.0);
    assert_eq!(verdict.severity, Severity::Critical);
    assert_eq!(
        verdict.explanation,
        "Event coordinates (0, 0) indicate sensor failure for IA API"
    );

    let plan = verdict.fallback.expect("anomalous verdicts carry a plan");
    assert_eq!(plan.source, FallbackSource::CachedCoordinates);
    assert_eq!(plan.latitude, Some(42.0));
    assert_eq!(plan.longitude, Some(-93.5));
    assert_eq!(plan.confidence, 0.6);
}

#[test]
fn test_stuck_feed_needs_five_identical_trailing_events() {
    let engine = DetectionEngine::new();
    let frozen: Vec<RoadwayEvent> = (0..5)
        .map(|i| event(&format!("ne-{i}"), "NE", 41.25, -96.0))
        .collect();
    let candidate = event("ne-next", "NE", 41.25, -96.0);

    // Four identical events are not yet a stuck feed.
    let verdict = engine.detect(&candidate, &frozen[..4]);
    assert!(!verdict.is_anomaly, "4 repeats must not trip the stuck rule");

    let verdict = engine.detect(&candidate, &frozen);
    assert!(verdict.is_anomaly);
    assert_eq!(verdict.kind, AnomalyKind::StuckApi);
    assert_eq!(verdict.score, 0.9);

    let plan = verdict.fallback.expect("stuck feeds get a plan");
    assert_eq!(plan.source, FallbackSource::SkipUpdate);
    assert_eq!(plan.action, Some(FallbackAction::RetainPreviousData));
    assert_eq!(plan.confidence, 0.8);
}

#[test]
fn test_timestamp_rules_over_real_histories() {
    let engine = DetectionEngine::new();

    let mut ahead = event("ks-1", "KS", 38.5, -96.8);
    ahead.timestamp = (Utc::now() + Duration::hours(6)).to_rfc3339();
    let verdict = engine.detect(&ahead, &[]);
    assert_eq!(verdict.kind, AnomalyKind::FutureTimestamp);
    assert_eq!(verdict.score, 0.95);

    let mut ancient = event("ks-2", "KS", 38.5, -96.8);
    ancient.timestamp = timestamp(24 * 14);
    let verdict = engine.detect(&ancient, &[]);
    assert_eq!(verdict.kind, AnomalyKind::StaleEvent);
    assert_eq!(verdict.score, 0.8);
    let plan = verdict.fallback.expect("stale events get a plan");
    assert_eq!(plan.source, FallbackSource::FilteredOut);
    assert_eq!(plan.action, Some(FallbackAction::RemoveFromActiveEvents));

    // Garbage stamps disable both rules rather than firing either.
    let mut garbled = event("ks-3", "KS", 38.5, -96.8);
    garbled.timestamp = "last tuesday".to_string();
    assert!(!engine.detect(&garbled, &[]).is_anomaly);
}

#[test]
fn test_verdicts_are_idempotent_and_score_is_method_max() {
    let engine = DetectionEngine::new();
    engine.train(&iowa_history(80)).unwrap();
    let context = iowa_history(30);

    let candidates = vec![
        event("a", "IA", 41.6, -93.6),
        event("b", "IA", 0.0, 0.0),
        event("c", "IA", 47.5, -110.0),
        event("d", "MN", 45.0, -93.3),
    ];

    for candidate in &candidates {
        let first = engine.detect(candidate, &context);
        let second = engine.detect(candidate, &context);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap(),
            "same inputs and snapshot must yield the same verdict"
        );

        let max = first
            .method_scores
            .statistical
            .max(first.method_scores.ml)
            .max(first.method_scores.pattern);
        assert!(
            (first.score - (max * 1000.0).round() / 1000.0).abs() < 1e-12,
            "fused score must be the rounded max of the method scores"
        );
        if first.is_anomaly {
            assert!(first.score > 0.0);
        }
    }
}

#[test]
fn test_duplicate_id_republish_fires_only_on_real_divergence() {
    let engine = DetectionEngine::new();
    let mut original = event("IA-5512", "IA", 41.7, -93.4);
    original
        .attributes
        .insert("update_count".to_string(), json!(3));

    // Routine re-poll: only the volatile counter moved.
    let mut refreshed = original.clone();
    refreshed
        .attributes
        .insert("update_count".to_string(), json!(4));
    let verdict = engine.detect(&refreshed, &[original.clone()]);
    assert!(!verdict.is_anomaly, "update_count churn is not a conflict");

    // Same id, moved location: a real conflict.
    let mut moved = original.clone();
    moved.latitude = 41.9;
    let verdict = engine.detect(&moved, &[original]);
    assert!(verdict.is_anomaly);
    assert_eq!(verdict.kind, AnomalyKind::DuplicateIdMismatch);
    assert_eq!(verdict.score, 0.85);
    assert_eq!(
        verdict.explanation,
        "Event ID IA-5512 reused with different data"
    );
}

#[test]
fn test_duplicate_fallback_interpolates_nearby_neighbors() {
    let engine = DetectionEngine::new();
    let mut original = event("IA-88", "IA", 41.98, -93.48);
    original.description = Some("original report".to_string());
    let context = vec![
        original,
        event("ia-n1", "IA", 42.0, -93.5),
        event("ia-n2", "IA", 42.2, -93.7),
    ];

    let mut conflicting = event("IA-88", "IA", 42.1, -93.6);
    conflicting.description = Some("contradicting report".to_string());

    let verdict = engine.detect(&conflicting, &context);
    assert_eq!(verdict.kind, AnomalyKind::DuplicateIdMismatch);

    // All three same-state neighbors sit within 50 km; the plan is their
    // coordinate-wise mean.
    let plan = verdict.fallback.expect("duplicate conflicts get a plan");
    assert_eq!(plan.source, FallbackSource::Interpolated);
    assert!((plan.latitude.unwrap() - 42.06).abs() < 1e-9);
    assert!((plan.longitude.unwrap() + 93.56).abs() < 1e-9);
    assert_eq!(plan.confidence, 0.5);
}

#[test]
fn test_anomaly_with_no_usable_neighbors_demands_manual_review() {
    let engine = DetectionEngine::new();
    // Valid-looking US coordinates are out of range; nothing nearby and
    // nothing same-state means there is nothing to repair from.
    let context = vec![event("mo-1", "MO", 38.6, -92.2)];
    let verdict = engine.detect(&event("ia-x", "IA", 55.0, -93.5), &context);

    assert_eq!(verdict.kind, AnomalyKind::InvalidCoordinates);
    let plan = verdict.fallback.expect("invalid coordinates get a plan");
    assert_eq!(plan.source, FallbackSource::NoneAvailable);
    assert_eq!(plan.action, Some(FallbackAction::ManualReviewRequired));
    assert_eq!(plan.confidence, 0.0);
}

#[test]
fn test_training_unlocks_spike_detection() {
    let engine = DetectionEngine::new();
    // Baseline of 12 IA events; a window holding 37 is past 3x that.
    engine.train(&iowa_history(12)).unwrap();

    let flood = iowa_history(37);
    let verdict = engine.detect(&event("ia-new", "IA", 41.7, -93.6), &flood);
    assert!(verdict.is_anomaly);
    assert_eq!(verdict.kind, AnomalyKind::EventSpike);
    assert_eq!(verdict.method_scores.pattern, 0.7);
    assert!(verdict.score >= 0.7);
    assert_eq!(
        verdict.explanation,
        "Unusual spike in events from IA - possible data corruption"
    );

    // 36 same-state events is exactly 3x: still normal volume.
    let verdict = engine.detect(&event("ia-new", "IA", 41.7, -93.6), &flood[..36]);
    assert_ne!(verdict.kind, AnomalyKind::EventSpike);
}

#[test]
fn test_training_unlocks_state_geography_check() {
    let engine = DetectionEngine::new();
    engine.train(&iowa_history(60)).unwrap();

    // Montana-range coordinates on an IA-tagged event: fine by the US box,
    // wrong by Iowa's profiled geography.
    let verdict = engine.detect(&event("ia-x", "IA", 47.5, -110.0), &[]);
    assert!(verdict.is_anomaly);
    assert_eq!(verdict.kind, AnomalyKind::OutOfStateBounds);
    assert_eq!(verdict.method_scores.pattern, 0.75);
    assert_eq!(
        verdict.explanation,
        "Event location doesn't match state IA geography"
    );
}

#[test]
fn test_failed_retrain_leaves_previous_model_intact() {
    let engine = DetectionEngine::new();
    engine.train(&iowa_history(60)).unwrap();
    let before = engine.model_info();

    engine
        .train(&[])
        .expect_err("training on an empty batch must fail");

    let after = engine.model_info();
    assert!(after.trained, "failed retrain must not discard the model");
    assert_eq!(after.training_samples, before.training_samples);
    assert_eq!(after.trained_at, before.trained_at);

    // And the surviving model keeps serving verdicts.
    let verdict = engine.detect(&event("ia-1", "IA", 41.6, -93.6), &[]);
    assert!(verdict.method_scores.ml > 0.0);
}

#[test]
fn test_statistical_kind_outranks_pattern_and_learned() {
    let engine = DetectionEngine::new();
    engine.train(&iowa_history(60)).unwrap();

    // (0,0) trips the zero-coordinate rule, leaves the IA bounding box, and
    // looks nothing like the training data. Classification still follows
    // the statistical rule.
    let verdict = engine.detect(&event("ia-x", "IA", 0.0, 0.0), &iowa_history(10));
    assert_eq!(verdict.kind, AnomalyKind::ZeroCoordinates);
    assert_eq!(verdict.method_scores.statistical, 1.0);
    assert_eq!(verdict.method_scores.pattern, 0.75);
    assert_eq!(verdict.score, 1.0);
}
