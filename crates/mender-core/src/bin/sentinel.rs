//! Roadmender Sentinel entrypoint.

use std::sync::Arc;

use mender_core::engine::DetectionEngine;
use mender_core::model::ModelStore;
use mender_core::sentinel::{self, SentinelConfig};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    info!("Initializing Roadmender Sentinel");

    // Initialize metrics
    let _ = &*sentinel::INGEST_TOTAL;
    let _ = &*sentinel::DETECT_REQUESTS;
    let _ = &*sentinel::DETECTIONS_TOTAL;
    let _ = &*sentinel::ANOMALIES_TOTAL;
    let _ = &*sentinel::DROPPED_TOTAL;
    let _ = &*sentinel::TRAIN_TOTAL;
    let _ = &*sentinel::DETECT_LATENCY;
    let _ = &*sentinel::WINDOW_EVENTS;
    let _ = &*sentinel::ACTIVE_STATES;
    let _ = &*mender_core::forward::ALERTS_SENT_TOTAL;

    let config = SentinelConfig::from_env();
    info!(
        shards = config.shards,
        window_capacity = config.window_capacity,
        model_path = %config.model_path.display(),
        alerts = config.alert_url.is_some(),
        "Configured."
    );

    let engine = Arc::new(DetectionEngine::with_store(ModelStore::new(
        &config.model_path,
    )));
    let (state, handles) = sentinel::spawn_pipeline(engine, &config);

    let app = sentinel::build_router(state.clone());
    let listener = TcpListener::bind(&config.addr)
        .await
        .expect("Failed to bind port");

    info!(addr = %config.addr, "Sentinel listening.");
    info!("Endpoints:");
    info!("  POST /api/ml/anomaly/detect - Score one event against context");
    info!("  POST /api/ml/anomaly/train  - Retrain from historical events");
    info!("  GET  /api/ml/anomaly/model  - Model metadata");
    info!("  POST /api/v1/ingest         - Batch event ingestion");
    info!("  GET  /metrics               - Prometheus metrics");
    info!("  GET  /health                - Health check");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("Shutting down... (Waiting for queues to drain)");
        })
        .await
        .expect("Server crash");

    drop(state);
    info!("Ingest channels closed.");

    handles.join();
    info!("Journal flushed. Goodbye.");
}
