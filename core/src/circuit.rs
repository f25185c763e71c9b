//! Per-provider circuit breaker.
//!
//! `Closed` → (threshold consecutive failures) → `Open` → (cooldown elapsed, on
//! the next admission check) → `HalfOpen` → (success) → `Closed`, or back to
//! `Open` once `half_open_max` probes have failed.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::event::{names, EventBus};
use crate::util::{lock, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub threshold: u32,
    /// Time spent open before a probe is admitted
    pub cooldown: Duration,
    /// Failed probes tolerated while half-open
    pub half_open_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_millis(15_000),
            half_open_max: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitStats {
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub times_opened: u64,
    pub last_failure_ms: Option<i64>,
    pub last_success_ms: Option<i64>,
}

/// Snapshot returned by [`CircuitBreaker::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub open_until_ms: Option<i64>,
    pub stats: CircuitStats,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    open_until: Option<Instant>,
    open_until_ms: i64,
    half_open_attempts: u32,
    stats: CircuitStats,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            open_until: None,
            open_until_ms: 0,
            half_open_attempts: 0,
            stats: CircuitStats::default(),
        }
    }
}

enum Transition {
    Opened { until_ms: i64 },
    Closed,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    bus: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::closed()),
            bus: None,
        }
    }

    /// Publish open/close transitions on `bus`.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Admission check. An open breaker whose cooldown has elapsed moves to
    /// `HalfOpen` here, never spontaneously.
    pub fn can_pass(&self) -> bool {
        let mut st = lock(&self.state);
        match st.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = st
                    .open_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true);
                if elapsed {
                    st.state = CircuitState::HalfOpen;
                    st.half_open_attempts = 0;
                    info!(target: "tts.circuit", name = %self.name, "Transitioning to half-open state");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => st.half_open_attempts < self.config.half_open_max,
        }
    }

    /// Record the outcome of one request.
    pub fn record(&self, success: bool) {
        let transition = {
            let mut st = lock(&self.state);
            st.stats.total_requests += 1;
            if success {
                st.stats.total_successes += 1;
                st.stats.last_success_ms = Some(now_ms());
                st.success_count = st.success_count.saturating_add(1);
                st.failure_count = 0;
                if st.state == CircuitState::HalfOpen {
                    st.state = CircuitState::Closed;
                    st.half_open_attempts = 0;
                    st.open_until = None;
                    Some(Transition::Closed)
                } else {
                    None
                }
            } else {
                st.stats.total_failures += 1;
                st.stats.last_failure_ms = Some(now_ms());
                st.failure_count = st.failure_count.saturating_add(1);
                st.success_count = 0;
                match st.state {
                    CircuitState::HalfOpen => {
                        st.half_open_attempts += 1;
                        if st.half_open_attempts >= self.config.half_open_max {
                            Some(self.open(&mut st))
                        } else {
                            None
                        }
                    }
                    CircuitState::Closed if st.failure_count >= self.config.threshold => {
                        Some(self.open(&mut st))
                    }
                    _ => None,
                }
            }
        };

        // Emit outside the lock: handlers may query this breaker.
        match transition {
            Some(Transition::Opened { until_ms }) => {
                warn!(
                    target: "tts.circuit",
                    name = %self.name,
                    until = %format_local_time(until_ms),
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "Circuit OPEN"
                );
                if let Some(bus) = &self.bus {
                    bus.emit(
                        names::TTS_CIRCUIT_OPEN,
                        json!({
                            "name": self.name,
                            "until": until_ms,
                            "cooldownMs": self.config.cooldown.as_millis() as u64,
                        }),
                    );
                }
            }
            Some(Transition::Closed) => {
                info!(target: "tts.circuit", name = %self.name, "Circuit CLOSED (recovered)");
                if let Some(bus) = &self.bus {
                    bus.emit(names::TTS_CIRCUIT_CLOSE, json!({ "name": self.name }));
                }
            }
            None => {}
        }
    }

    fn open(&self, st: &mut BreakerState) -> Transition {
        st.state = CircuitState::Open;
        st.open_until = Some(Instant::now() + self.config.cooldown);
        st.open_until_ms = now_ms() + self.config.cooldown.as_millis() as i64;
        st.half_open_attempts = 0;
        st.stats.times_opened += 1;
        Transition::Opened {
            until_ms: st.open_until_ms,
        }
    }

    /// Force the breaker closed and zero every counter (manual recovery).
    ///
    /// A breaker that was not closed announces the close on the bus.
    pub fn reset(&self) {
        let was_closed = {
            let mut st = lock(&self.state);
            let was_closed = st.state == CircuitState::Closed;
            st.state = CircuitState::Closed;
            st.failure_count = 0;
            st.success_count = 0;
            st.open_until = None;
            st.open_until_ms = 0;
            st.half_open_attempts = 0;
            st.stats = CircuitStats::default();
            was_closed
        };
        info!(target: "tts.circuit", name = %self.name, "Circuit reset");
        if let (false, Some(bus)) = (was_closed, &self.bus) {
            bus.emit(names::TTS_CIRCUIT_CLOSE, json!({ "name": self.name }));
        }
    }

    pub fn state(&self) -> CircuitState {
        lock(&self.state).state
    }

    pub fn failure_count(&self) -> u32 {
        lock(&self.state).failure_count
    }

    pub fn status(&self) -> CircuitStatus {
        let st = lock(&self.state);
        CircuitStatus {
            name: self.name.clone(),
            state: st.state,
            failure_count: st.failure_count,
            success_count: st.success_count,
            open_until_ms: (st.state == CircuitState::Open).then_some(st.open_until_ms),
            stats: st.stats.clone(),
        }
    }
}

fn format_local_time(epoch_ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(epoch_ms)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| epoch_ms.to_string())
}
