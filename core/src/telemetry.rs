// Telemetry and observability for the TTS core
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::event::{names, EventBus, Unsubscribe};
use crate::util::{lock, now_ms};

const MAX_ERROR_HISTORY: usize = 50;
const MAX_QUEUE_SAMPLES: usize = 100;
const MAX_LATENCY_SAMPLES: usize = 100;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. Safe to call more than once;
/// later calls are no-ops.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp_ms: i64,
    pub job_id: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
struct Metrics {
    requests: u64,
    successes: u64,
    failures: u64,
    total_latency_ms: u64,
    circuit_opens: u64,
    latencies: VecDeque<Duration>,
    queue_depth_samples: VecDeque<(i64, usize)>,
    errors: VecDeque<ErrorRecord>,
}

/// Aggregated view returned by [`TtsTelemetry::report`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Percentage in `[0, 100]`, `None` before the first request
    pub success_rate: Option<f64>,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub avg_queue_depth: f64,
    pub circuit_opens: u64,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Counts, latencies and recent errors for diagnostics.
#[derive(Default)]
pub struct TtsTelemetry {
    metrics: Mutex<Metrics>,
}

impl TtsTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to lane and circuit events.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Vec<Unsubscribe> {
        let mut subs = Vec::with_capacity(5);

        let weak = Arc::downgrade(self);
        subs.push(bus.on(names::TTS_PLAY_START, move |_| {
            if let Some(t) = weak.upgrade() {
                lock(&t.metrics).requests += 1;
            }
        }));

        let weak = Arc::downgrade(self);
        subs.push(bus.on(names::TTS_PLAY_END, move |event| {
            let success = event
                .payload
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if let (true, Some(t)) = (success, weak.upgrade()) {
                lock(&t.metrics).successes += 1;
            }
        }));

        let weak = Arc::downgrade(self);
        subs.push(bus.on(names::TTS_PLAY_ERROR, move |event| {
            if let Some(t) = weak.upgrade() {
                let job_id = event
                    .payload
                    .get("jobId")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let error = event
                    .payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                t.record_error(job_id, error);
            }
        }));

        let weak = Arc::downgrade(self);
        subs.push(bus.on(names::TTS_CIRCUIT_OPEN, move |_| {
            if let Some(t) = weak.upgrade() {
                lock(&t.metrics).circuit_opens += 1;
            }
        }));

        let weak = Arc::downgrade(self);
        subs.push(bus.on(names::TTS_QUEUE_ADD, move |event| {
            if let Some(t) = weak.upgrade() {
                if let Some(depth) = event.payload.get("queueLength").and_then(Value::as_u64) {
                    t.sample_queue_depth(depth as usize);
                }
            }
        }));

        subs
    }

    fn record_error(&self, job_id: Option<String>, error: String) {
        let mut m = lock(&self.metrics);
        m.failures += 1;
        m.errors.push_back(ErrorRecord {
            timestamp_ms: now_ms(),
            job_id,
            error,
        });
        while m.errors.len() > MAX_ERROR_HISTORY {
            m.errors.pop_front();
        }
    }

    /// Record end-to-end latency of a successful utterance.
    pub fn record_latency(&self, latency: Duration) {
        let mut m = lock(&self.metrics);
        m.total_latency_ms += latency.as_millis() as u64;
        m.latencies.push_back(latency);
        while m.latencies.len() > MAX_LATENCY_SAMPLES {
            m.latencies.pop_front();
        }
    }

    pub fn sample_queue_depth(&self, depth: usize) {
        let mut m = lock(&self.metrics);
        m.queue_depth_samples.push_back((now_ms(), depth));
        while m.queue_depth_samples.len() > MAX_QUEUE_SAMPLES {
            m.queue_depth_samples.pop_front();
        }
    }

    pub fn report(&self) -> TelemetryReport {
        let m = lock(&self.metrics);

        let avg_latency_ms = if m.successes > 0 {
            m.total_latency_ms as f64 / m.successes as f64
        } else {
            0.0
        };

        let mut sorted: Vec<Duration> = m.latencies.iter().copied().collect();
        sorted.sort();
        let p99_idx = (sorted.len() as f64 * 0.99) as usize;
        let p99_latency_ms = sorted
            .get(p99_idx.min(sorted.len().saturating_sub(1)))
            .map(|d| d.as_millis() as f64)
            .unwrap_or(0.0);

        let avg_queue_depth = if m.queue_depth_samples.is_empty() {
            0.0
        } else {
            m.queue_depth_samples.iter().map(|(_, d)| *d as f64).sum::<f64>()
                / m.queue_depth_samples.len() as f64
        };

        TelemetryReport {
            total_requests: m.requests,
            successes: m.successes,
            failures: m.failures,
            success_rate: (m.requests > 0)
                .then(|| m.successes as f64 / m.requests as f64 * 100.0),
            avg_latency_ms,
            p99_latency_ms,
            avg_queue_depth,
            circuit_opens: m.circuit_opens,
            recent_errors: m.errors.iter().rev().take(5).rev().cloned().collect(),
        }
    }

    /// Print the report to the log
    pub fn print_report(&self) {
        let r = self.report();
        info!("=== TTS Telemetry ===");
        info!("Requests: {}", r.total_requests);
        match r.success_rate {
            Some(rate) => info!("Success Rate: {:.1}%", rate),
            None => info!("Success Rate: N/A"),
        }
        info!("Avg Latency: {:.0}ms", r.avg_latency_ms);
        info!("P99 Latency: {:.0}ms", r.p99_latency_ms);
        info!("Avg Queue Depth: {:.1}", r.avg_queue_depth);
        info!("Circuit Opens: {}", r.circuit_opens);
    }

    pub fn reset(&self) {
        *lock(&self.metrics) = Metrics::default();
    }
}
