//! Roadmender Sentinel: feed-guarding HTTP service.
//!
//! Features:
//! - SIMD-JSON parsing on the hot ingest path
//! - Sharded worker threads, one context-window registry per shard
//! - Detect, train, and model endpoints over the shared engine
//! - Hourly-rotated anomaly journal (JSONL)
//! - Optional webhook alert forwarding
//! - Prometheus metrics

use axum::{
    body::Bytes,
    extract::{FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use once_cell::sync::Lazy;
use prometheus::{Counter, Encoder, Gauge, Histogram, TextEncoder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::{io::Write, thread};
use tracing::{error, info, warn};

use crate::engine::{DetectionEngine, ModelInfo, TrainingReport};
use crate::event::RoadwayEvent;
use crate::forward::{AlertForwarder, AlertRecord, ForwarderConfig};
use crate::verdict::{AnomalyKind, FallbackPlan, MethodScores, Severity, Verdict};
use crate::window::{WindowRegistry, DEFAULT_MAX_STATES, DEFAULT_WINDOW_CAPACITY};

// ============================================================================
// METRICS
// ============================================================================

pub static INGEST_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("mender_ingest_total", "Total events ingested").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DETECT_REQUESTS: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("mender_detect_requests_total", "Total detect API calls").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DETECTIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "mender_detections_total",
        "Total events scored by shard workers",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ANOMALIES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("mender_anomalies_total", "Total anomalies detected").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DROPPED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "mender_dropped_total",
        "Total events dropped due to backpressure",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static TRAIN_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("mender_train_total", "Total successful model trainings").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DETECT_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "mender_detect_duration_seconds",
        "Histogram of detection latency",
    ))
    .unwrap();
    prometheus::register(Box::new(h.clone())).unwrap();
    h
});

pub static WINDOW_EVENTS: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new("mender_window_events", "Events held across context windows").unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static ACTIVE_STATES: Lazy<Gauge> = Lazy::new(|| {
    let g = Gauge::new(
        "mender_active_states",
        "States with an active context window",
    )
    .unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

// ============================================================================
// WIRE TYPES
// ============================================================================

/// External API: detect request. `events` overrides the server-side context
/// window when callers want to replay their own history.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectRequest {
    pub current_event: RoadwayEvent,
    #[serde(default)]
    pub events: Vec<RoadwayEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectResponse {
    pub success: bool,
    pub is_anomaly: bool,
    pub anomaly_score: f64,
    /// Always present; clean events report `"none"`.
    pub anomaly_type: AnomalyKind,
    pub fallback_data: Option<FallbackPlan>,
    pub explanation: String,
    pub method_scores: MethodScores,
    pub severity: Severity,
}

impl DetectResponse {
    fn from_verdict(verdict: Verdict) -> Self {
        Self {
            success: true,
            is_anomaly: verdict.is_anomaly,
            anomaly_score: verdict.score,
            anomaly_type: verdict.kind,
            fallback_data: verdict.fallback,
            explanation: verdict.explanation,
            method_scores: verdict.method_scores,
            severity: verdict.severity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainResponse {
    pub success: bool,
    pub metrics: TrainingReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_trained: bool,
}

/// Anomaly record persisted to the journal.
#[derive(Debug, Clone, Serialize)]
pub struct JournalRecord {
    pub event_id: String,
    pub state: String,
    pub anomaly_type: AnomalyKind,
    pub score: f64,
    pub severity: Severity,
    pub method_scores: MethodScores,
    pub explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackPlan>,
    pub detected_at: String,
}

impl JournalRecord {
    fn new(event: &RoadwayEvent, verdict: &Verdict) -> Self {
        Self {
            event_id: event.id.clone(),
            state: event.state.clone(),
            anomaly_type: verdict.kind,
            score: verdict.score,
            severity: verdict.severity,
            method_scores: verdict.method_scores,
            explanation: verdict.explanation.clone(),
            fallback: verdict.fallback.clone(),
            detected_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

pub const DEFAULT_ADDR: &str = "0.0.0.0:8090";
pub const DEFAULT_MODEL_PATH: &str = "data/model.bin";
pub const DEFAULT_DATA_DIR: &str = "data";

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub addr: String,
    pub model_path: PathBuf,
    pub data_dir: PathBuf,
    pub shards: usize,
    pub window_capacity: usize,
    pub max_states: usize,
    pub alert_url: Option<String>,
}

impl SentinelConfig {
    pub fn from_env() -> Self {
        let addr =
            std::env::var("SENTINEL_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
        let model_path = std::env::var_os("MENDER_MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH));
        let data_dir = std::env::var_os("MENDER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let shards = std::env::var("MENDER_SHARDS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or_else(|| {
                thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
            });
        let window_capacity = std::env::var("MENDER_WINDOW_CAP")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_WINDOW_CAPACITY);
        let alert_url = std::env::var("MENDER_ALERT_URL")
            .ok()
            .filter(|url| !url.is_empty());

        Self {
            addr,
            model_path,
            data_dir,
            shards,
            window_capacity,
            max_states: DEFAULT_MAX_STATES,
            alert_url,
        }
    }
}

/// Events shard by state so one state's context stays on one worker.
pub fn shard_for(state: &str, shards: usize) -> usize {
    (xxhash_rust::xxh3::xxh3_64(state.as_bytes()) as usize) % shards.max(1)
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    engine: Arc<DetectionEngine>,
    shard_txs: Arc<Vec<Sender<RoadwayEvent>>>,
    windows: Arc<Vec<RwLock<WindowRegistry>>>,
}

impl AppState {
    pub fn engine(&self) -> &Arc<DetectionEngine> {
        &self.engine
    }
}

fn snapshot_window(windows: &[RwLock<WindowRegistry>], state: &str) -> Vec<RoadwayEvent> {
    let shard = shard_for(state, windows.len());
    match windows[shard].read() {
        Ok(guard) => guard.snapshot(state),
        Err(poisoned) => poisoned.into_inner().snapshot(state),
    }
}

// ============================================================================
// SIMD-JSON EXTRACTOR
// ============================================================================

struct SimdJson<T>(T);

impl<T, S> FromRequest<S> for SimdJson<T>
where
    T: for<'de> Deserialize<'de> + Send,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, _state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, _state)
            .await
            .map_err(|e| e.into_response())?;
        let mut bytes_vec = bytes.to_vec();

        let val = simd_json::from_slice::<T>(&mut bytes_vec)
            .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid JSON").into_response())?;

        Ok(SimdJson(val))
    }
}

// ============================================================================
// SHARD WORKER
// ============================================================================

struct ShardWorker {
    id: usize,
    rx: Receiver<RoadwayEvent>,
    engine: Arc<DetectionEngine>,
    windows: Arc<Vec<RwLock<WindowRegistry>>>,
    journal_tx: Sender<String>,
    forwarder: Option<Arc<AlertForwarder>>,
    processed: u64,
}

impl ShardWorker {
    fn spawn(
        id: usize,
        rx: Receiver<RoadwayEvent>,
        engine: Arc<DetectionEngine>,
        windows: Arc<Vec<RwLock<WindowRegistry>>>,
        journal_tx: Sender<String>,
        forwarder: Option<Arc<AlertForwarder>>,
    ) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name(format!("mender-shard-{}", id))
            .spawn(move || {
                let mut worker = ShardWorker {
                    id,
                    rx,
                    engine,
                    windows,
                    journal_tx,
                    forwarder,
                    processed: 0,
                };
                worker.run();
                info!(shard = id, "Shard worker stopped.");
            })
            .expect("Failed to spawn shard thread")
    }

    fn run(&mut self) {
        info!(shard = self.id, "Shard worker active.");

        loop {
            match self.rx.recv_timeout(std::time::Duration::from_millis(100)) {
                Ok(event) => self.handle(event),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn handle(&mut self, event: RoadwayEvent) {
        let timer = DETECT_LATENCY.start_timer();

        // Detect against the window as it stood before this event; the event
        // joins the window afterwards either way, so repeats can accumulate.
        let context = match self.windows[self.id].read() {
            Ok(guard) => guard.snapshot(&event.state),
            Err(poisoned) => poisoned.into_inner().snapshot(&event.state),
        };
        let verdict = self.engine.detect(&event, &context);
        DETECTIONS_TOTAL.inc();

        if verdict.is_anomaly {
            ANOMALIES_TOTAL.inc();

            let record = JournalRecord::new(&event, &verdict);
            let line = serde_json::to_string(&record).unwrap_or_default();
            let _ = self.journal_tx.try_send(line + "\n");

            if let Some(forwarder) = &self.forwarder {
                let _ = forwarder.try_send(AlertRecord::from_verdict(&event, &verdict));
            }

            if verdict.severity >= Severity::High {
                warn!(
                    shard = self.id,
                    event_id = %event.id,
                    state = %event.state,
                    score = verdict.score,
                    kind = verdict.kind.as_str(),
                    "High severity anomaly: {}",
                    verdict.explanation
                );
            }
        }

        match self.windows[self.id].write() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }

        timer.observe_duration();

        self.processed += 1;
        if self.processed % 1000 == 0 {
            self.refresh_gauges();
        }
    }

    fn refresh_gauges(&self) {
        let mut events = 0;
        let mut states = 0;
        for window in self.windows.iter() {
            if let Ok(guard) = window.read() {
                events += guard.event_count();
                states += guard.state_count();
            }
        }
        WINDOW_EVENTS.set(events as f64);
        ACTIVE_STATES.set(states as f64);
    }
}

// ============================================================================
// JOURNAL WRITER
// ============================================================================

struct JournalWriter;

impl JournalWriter {
    fn spawn(dir: PathBuf, rx: Receiver<String>) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("mender-journal".into())
            .spawn(move || {
                let _ = std::fs::create_dir_all(&dir);
                let mut current_hour = chrono::Local::now().format("%Y%m%d%H").to_string();
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(format!("anomalies_{}.jsonl", current_hour)))
                    .expect("Failed to open anomaly journal");

                let mut buffer = std::io::BufWriter::with_capacity(128 * 1024, file);

                info!("Journal writer active.");

                while let Ok(msg) = rx.recv() {
                    let now_hour = chrono::Local::now().format("%Y%m%d%H").to_string();
                    if now_hour != current_hour {
                        let _ = buffer.flush();
                        current_hour = now_hour;
                        let new_file = std::fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(dir.join(format!("anomalies_{}.jsonl", current_hour)))
                            .expect("Failed to rotate journal");
                        buffer = std::io::BufWriter::with_capacity(128 * 1024, new_file);
                    }

                    let _ = buffer.write_all(msg.as_bytes());
                }

                let _ = buffer.flush();
                info!("Journal writer stopped.");
            })
            .expect("Failed to spawn journal thread")
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn detect_handler(
    State(state): State<AppState>,
    SimdJson(request): SimdJson<DetectRequest>,
) -> Json<DetectResponse> {
    DETECT_REQUESTS.inc();

    let verdict = if request.events.is_empty() {
        let context = snapshot_window(&state.windows, &request.current_event.state);
        state.engine.detect(&request.current_event, &context)
    } else {
        state.engine.detect(&request.current_event, &request.events)
    };

    Json(DetectResponse::from_verdict(verdict))
}

async fn train_handler(
    State(state): State<AppState>,
    SimdJson(events): SimdJson<Vec<RoadwayEvent>>,
) -> Response {
    let engine = state.engine.clone();
    let outcome = tokio::task::spawn_blocking(move || engine.train(&events)).await;

    match outcome {
        Ok(Ok(report)) => {
            TRAIN_TOTAL.inc();
            Json(TrainResponse {
                success: true,
                metrics: report,
            })
            .into_response()
        }
        Ok(Err(err)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                success: false,
                error: err.to_string(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "Training task failed.");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    success: false,
                    error: "training task failed".to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn ingest_handler(
    State(state): State<AppState>,
    SimdJson(events): SimdJson<Vec<RoadwayEvent>>,
) -> (StatusCode, Json<IngestResponse>) {
    INGEST_TOTAL.inc_by(events.len() as f64);

    let mut accepted = 0;
    let mut dropped = 0;
    for event in events {
        let shard = shard_for(&event.state, state.shard_txs.len());
        match state.shard_txs[shard].try_send(event) {
            Ok(()) => accepted += 1,
            Err(_) => {
                dropped += 1;
                DROPPED_TOTAL.inc();
            }
        }
    }

    (StatusCode::ACCEPTED, Json(IngestResponse { accepted, dropped }))
}

async fn model_handler(State(state): State<AppState>) -> Json<ModelInfo> {
    Json(state.engine.model_info())
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model_trained: state.engine.is_trained(),
    })
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

// ============================================================================
// PIPELINE ASSEMBLY
// ============================================================================

pub struct PipelineHandles {
    worker_handles: Vec<thread::JoinHandle<()>>,
    journal_handle: thread::JoinHandle<()>,
}

impl PipelineHandles {
    /// Blocks until workers and the journal drain. Call after every sender
    /// clone of the app state has been dropped.
    pub fn join(self) {
        for handle in self.worker_handles {
            handle.join().expect("Shard worker panicked");
        }
        self.journal_handle.join().expect("Journal writer panicked");
    }
}

/// Wires windows, shard workers, the journal, and the optional alert
/// forwarder. Must run inside a tokio runtime when an alert URL is set.
pub fn spawn_pipeline(
    engine: Arc<DetectionEngine>,
    config: &SentinelConfig,
) -> (AppState, PipelineHandles) {
    let shards = config.shards.max(1);
    let windows: Arc<Vec<RwLock<WindowRegistry>>> = Arc::new(
        (0..shards)
            .map(|_| RwLock::new(WindowRegistry::new(config.max_states, config.window_capacity)))
            .collect(),
    );

    let (journal_tx, journal_rx) = bounded::<String>(200_000);
    let journal_handle = JournalWriter::spawn(config.data_dir.clone(), journal_rx);

    let forwarder = config
        .alert_url
        .as_ref()
        .map(|url| Arc::new(AlertForwarder::new(ForwarderConfig::new(url.clone()))));

    let mut txs = Vec::new();
    let mut worker_handles = Vec::new();
    for id in 0..shards {
        let (tx, rx) = bounded::<RoadwayEvent>(100_000);
        txs.push(tx);
        worker_handles.push(ShardWorker::spawn(
            id,
            rx,
            engine.clone(),
            windows.clone(),
            journal_tx.clone(),
            forwarder.clone(),
        ));
    }

    drop(journal_tx);

    let state = AppState {
        engine,
        shard_txs: Arc::new(txs),
        windows,
    };
    let handles = PipelineHandles {
        worker_handles,
        journal_handle,
    };
    (state, handles)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/ml/anomaly/detect", post(detect_handler))
        .route("/api/ml/anomaly/train", post(train_handler))
        .route("/api/ml/anomaly/model", get(model_handler))
        .route("/api/v1/ingest", post(ingest_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
