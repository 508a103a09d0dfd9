//! Alert forwarding.
//!
//! Pushes anomalous verdicts to an operator webhook over HTTP. Bounded
//! queue, batched flushes, retry with backoff; the detection path never
//! blocks on a slow webhook.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::Counter;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::event::RoadwayEvent;
use crate::verdict::{AnomalyKind, Severity, Verdict};

pub const ALERT_SCHEMA_VERSION: u16 = 1;

pub static ALERTS_SENT_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new(
        "mender_alerts_sent_total",
        "Total alerts delivered to the webhook",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

/// One quarantined event, as the webhook sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub schema_version: u16,
    pub event_id: String,
    pub state: String,
    pub anomaly_type: AnomalyKind,
    pub score: f64,
    pub severity: Severity,
    pub explanation: String,
    pub detected_at: String,
}

impl AlertRecord {
    pub fn from_verdict(event: &RoadwayEvent, verdict: &Verdict) -> Self {
        Self {
            schema_version: ALERT_SCHEMA_VERSION,
            event_id: event.id.clone(),
            state: event.state.clone(),
            anomaly_type: verdict.kind,
            score: verdict.score,
            severity: verdict.severity,
            explanation: verdict.explanation.clone(),
            detected_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertBatch {
    pub alerts: Vec<AlertRecord>,
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub endpoint: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub channel_capacity: usize,
    pub timeout_ms: u64,
}

impl ForwarderConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            batch_size: 50,
            flush_interval_ms: 1000,
            max_retries: 3,
            retry_base_delay_ms: 100,
            channel_capacity: 10_000,
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Default)]
pub struct ForwarderStats {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub dropped: AtomicU64,
    pub batches: AtomicU64,
}

pub struct AlertForwarder {
    tx: mpsc::Sender<AlertRecord>,
    stats: Arc<ForwarderStats>,
}

impl AlertForwarder {
    /// Spawns the flush worker on the current tokio runtime.
    pub fn new(config: ForwarderConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let stats = Arc::new(ForwarderStats::default());
        let worker_stats = stats.clone();

        tokio::spawn(async move {
            Self::worker(rx, config, worker_stats).await;
        });

        Self { tx, stats }
    }

    pub fn stats(&self) -> &ForwarderStats {
        &self.stats
    }

    /// Non-blocking enqueue. A full queue sheds the alert rather than
    /// stalling the caller.
    pub fn try_send(&self, alert: AlertRecord) -> Result<(), AlertRecord> {
        match self.tx.try_send(alert) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(alert))
            | Err(mpsc::error::TrySendError::Closed(alert)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(alert)
            }
        }
    }

    async fn worker(
        mut rx: mpsc::Receiver<AlertRecord>,
        config: ForwarderConfig,
        stats: Arc<ForwarderStats>,
    ) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_max_idle_per_host(4)
            .build()
            .unwrap();

        let mut batch: Vec<AlertRecord> = Vec::with_capacity(config.batch_size);
        let mut interval = tokio::time::interval(Duration::from_millis(config.flush_interval_ms));

        info!(endpoint = %config.endpoint, "alert forwarder started");

        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some(alert) => {
                            batch.push(alert);
                            if batch.len() >= config.batch_size {
                                Self::flush_batch(&client, &mut batch, &config, &stats).await;
                            }
                        }
                        None => break,
                    }
                }
                _ = interval.tick() => {
                    if !batch.is_empty() {
                        Self::flush_batch(&client, &mut batch, &config, &stats).await;
                    }
                }
            }
        }

        // Drain whatever arrived between the last flush and channel close.
        if !batch.is_empty() {
            Self::flush_batch(&client, &mut batch, &config, &stats).await;
        }

        info!("alert forwarder stopped");
    }

    async fn flush_batch(
        client: &reqwest::Client,
        batch: &mut Vec<AlertRecord>,
        config: &ForwarderConfig,
        stats: &ForwarderStats,
    ) {
        if batch.is_empty() {
            return;
        }

        let payload = AlertBatch {
            alerts: std::mem::take(batch),
        };
        let count = payload.alerts.len();

        for attempt in 0..=config.max_retries {
            match client.post(&config.endpoint).json(&payload).send().await {
                Ok(response) => {
                    if response.status().is_success() {
                        stats.sent.fetch_add(count as u64, Ordering::Relaxed);
                        stats.batches.fetch_add(1, Ordering::Relaxed);
                        ALERTS_SENT_TOTAL.inc_by(count as f64);
                        debug!(count, "forwarded alerts");
                        return;
                    } else if response.status() == StatusCode::TOO_MANY_REQUESTS {
                        warn!(attempt, status = %response.status(), "webhook rate limited");
                    } else {
                        warn!(attempt, status = %response.status(), "webhook returned error");
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "failed to reach webhook");
                }
            }

            if attempt < config.max_retries {
                stats.retried.fetch_add(1, Ordering::Relaxed);
                let delay = config.retry_base_delay_ms * (1 << attempt);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        stats.failed.fetch_add(count as u64, Ordering::Relaxed);
        error!(count, "dropped alerts after max retries");
    }
}
