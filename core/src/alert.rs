//! Sliding-window error-rate monitor.
//!
//! Samples come from play-end / play-error events. A `high_error_rate` alert
//! fires at most once per cooldown; a circuit opening raises a `circuit_open`
//! alert immediately and puts the service in degraded mode until every open
//! circuit has closed again.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::event::{names, Event, EventBus, Unsubscribe};
use crate::util::{lock, now_ms};

type AlertCallback = Arc<dyn Fn(&Alert) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub window_size: Duration,
    pub min_samples: usize,
    /// Failure ratio in `[0, 1]` at or above which an alert fires
    pub error_rate_threshold: f64,
    pub cooldown: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            window_size: Duration::from_millis(60_000),
            min_samples: 5,
            error_rate_threshold: 0.5,
            cooldown: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Alert {
    HighErrorRate {
        rate: f64,
        failures: usize,
        total: usize,
        timestamp_ms: i64,
    },
    CircuitOpen {
        provider: String,
        cooldown_ms: u64,
        until_ms: Option<i64>,
        timestamp_ms: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertStatus {
    pub error_rate: f64,
    pub sample_size: usize,
    pub degraded: bool,
    pub last_alert_ms: Option<i64>,
    pub open_circuits: Vec<String>,
}

#[derive(Debug)]
struct WindowState {
    samples: VecDeque<(Instant, bool)>,
    last_alert: Option<Instant>,
    last_alert_ms: Option<i64>,
    open_circuits: HashSet<String>,
}

impl WindowState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn counts(&self) -> (usize, usize) {
        let failures = self.samples.iter().filter(|(_, ok)| !ok).count();
        (failures, self.samples.len())
    }
}

pub struct TtsAlertManager {
    config: AlertConfig,
    bus: EventBus,
    state: Mutex<WindowState>,
    callbacks: Mutex<Vec<AlertCallback>>,
}

impl TtsAlertManager {
    pub fn new(bus: EventBus, config: AlertConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            state: Mutex::new(WindowState {
                samples: VecDeque::new(),
                last_alert: None,
                last_alert_ms: None,
                open_circuits: HashSet::new(),
            }),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn on_alert<F>(&self, callback: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        lock(&self.callbacks).push(Arc::new(callback));
    }

    /// Subscribe to playback and circuit events on the bus.
    pub fn attach(self: &Arc<Self>) -> Vec<Unsubscribe> {
        let mut subs = Vec::with_capacity(4);

        let weak = Arc::downgrade(self);
        subs.push(self.bus.on(names::TTS_PLAY_END, move |event| {
            // Stale / superseded discards are not synthesis failures
            if event.payload.get("reason").is_some() {
                return;
            }
            if let Some(mgr) = weak.upgrade() {
                let success = event
                    .payload
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                mgr.record(success);
            }
        }));

        let weak = Arc::downgrade(self);
        subs.push(self.bus.on(names::TTS_PLAY_ERROR, move |_| {
            if let Some(mgr) = weak.upgrade() {
                mgr.record(false);
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        subs.push(self.bus.on(names::TTS_CIRCUIT_OPEN, move |event| {
            if let Some(mgr) = weak.upgrade() {
                mgr.circuit_opened(event);
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        subs.push(self.bus.on(names::TTS_CIRCUIT_CLOSE, move |event| {
            if let Some(mgr) = weak.upgrade() {
                if let Some(name) = event.payload.get("name").and_then(Value::as_str) {
                    mgr.circuit_closed(name);
                }
            }
        }));

        subs
    }

    /// Feed one playback outcome into the window.
    pub fn record(&self, success: bool) {
        let alert = {
            let now = Instant::now();
            let mut st = lock(&self.state);
            st.samples.push_back((now, success));
            st.prune(now, self.config.window_size);

            let (failures, total) = st.counts();
            let cooled_down = st
                .last_alert
                .map(|at| now.duration_since(at) >= self.config.cooldown)
                .unwrap_or(true);
            if total < self.config.min_samples || !cooled_down {
                return;
            }
            let rate = failures as f64 / total as f64;
            if rate < self.config.error_rate_threshold {
                return;
            }
            let timestamp_ms = now_ms();
            st.last_alert = Some(now);
            st.last_alert_ms = Some(timestamp_ms);
            Alert::HighErrorRate {
                rate,
                failures,
                total,
                timestamp_ms,
            }
        };
        warn!(target: "tts.alert", alert = ?alert, "TTS error rate above threshold");
        self.fire(alert);
    }

    fn circuit_opened(&self, event: &Event) {
        let provider = event
            .payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let cooldown_ms = event
            .payload
            .get("cooldownMs")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let until_ms = event.payload.get("until").and_then(Value::as_i64);
        {
            let mut st = lock(&self.state);
            st.open_circuits.insert(provider.clone());
            st.last_alert_ms = Some(now_ms());
        }
        warn!(target: "tts.alert", provider = %provider, cooldown_ms, "Entering degraded mode");
        self.fire(Alert::CircuitOpen {
            provider,
            cooldown_ms,
            until_ms,
            timestamp_ms: now_ms(),
        });
    }

    fn circuit_closed(&self, provider: &str) {
        let mut st = lock(&self.state);
        st.open_circuits.remove(provider);
        if st.open_circuits.is_empty() {
            info!(target: "tts.alert", provider, "Leaving degraded mode");
        }
    }

    fn fire(&self, alert: Alert) {
        let callbacks = lock(&self.callbacks).clone();
        for cb in callbacks {
            cb(&alert);
        }
        match serde_json::to_value(&alert) {
            Ok(payload) => {
                self.bus.emit(names::TTS_ALERT, payload);
            }
            Err(e) => warn!(target: "tts.alert", error = %e, "Failed to encode alert"),
        }
    }

    pub fn is_degraded(&self) -> bool {
        !lock(&self.state).open_circuits.is_empty()
    }

    pub fn status(&self) -> AlertStatus {
        let mut st = lock(&self.state);
        st.prune(Instant::now(), self.config.window_size);
        let (failures, total) = st.counts();
        let mut open: Vec<String> = st.open_circuits.iter().cloned().collect();
        open.sort();
        AlertStatus {
            error_rate: if total > 0 {
                failures as f64 / total as f64
            } else {
                0.0
            },
            sample_size: total,
            degraded: !open.is_empty(),
            last_alert_ms: st.last_alert_ms,
            open_circuits: open,
        }
    }

    pub fn reset(&self) {
        let mut st = lock(&self.state);
        st.samples.clear();
        st.last_alert = None;
        st.last_alert_ms = None;
        st.open_circuits.clear();
    }
}
