//! TTS provider abstraction with health-ranked failover.
//!
//! Each registered provider owns one [`CircuitBreaker`] and one rolling health
//! score in `[0, 100]`. Every call tries providers in descending score order,
//! recomputed per call, skipping those whose breaker refuses admission.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::event::{names, EventBus};
use crate::retry::{with_retry, RetryPolicy};
use crate::util::lock;
use crate::{Result, TtsError};

const LATENCY_SAMPLES: usize = 20;
const INITIAL_HEALTH: f64 = 100.0;

/// Synthesized audio payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioBlob {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl AudioBlob {
    pub fn new(bytes: impl Into<Vec<u8>>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// What a provider hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioOutput {
    /// Playable audio, to be cached and sent to the audio sink
    Blob(AudioBlob),
    /// The engine already produced sound itself (nothing to play or cache)
    Spoken,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisOptions {
    pub voice: Option<String>,
    pub rate: Option<u32>,
    pub pitch: Option<u32>,
}

/// Speech synthesis backend.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Synthesize `text`. Implementations must return [`TtsError::Aborted`]
    /// promptly once `cancel` fires.
    async fn synthesize(
        &self,
        text: &str,
        options: &SynthesisOptions,
        cancel: CancellationToken,
    ) -> Result<AudioOutput>;
}

/// Per-provider registration settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub half_open_max: u32,
    /// Extra attempts after the first one
    pub retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_millis(15_000),
            half_open_max: 2,
            retries: 1,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_millis(5_000),
        }
    }
}

/// Arguments for [`ProviderManager::speak`].
#[derive(Debug, Clone, Default)]
pub struct SpeakRequest {
    pub voice: Option<String>,
    pub rate: Option<u32>,
    pub pitch: Option<u32>,
    pub skip_providers: Vec<String>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: String,
    pub health_score: f64,
    pub circuit_state: CircuitState,
    pub avg_latency_ms: Option<f64>,
    pub successes: u64,
    pub failures: u64,
    pub enabled: bool,
}

#[derive(Debug)]
struct ProviderMetrics {
    health: f64,
    latencies: VecDeque<u64>,
    successes: u64,
    failures: u64,
}

impl ProviderMetrics {
    fn new() -> Self {
        Self {
            health: INITIAL_HEALTH,
            latencies: VecDeque::with_capacity(LATENCY_SAMPLES),
            successes: 0,
            failures: 0,
        }
    }

    fn record_success(&mut self, latency_ms: u64) {
        self.successes += 1;
        self.latencies.push_back(latency_ms);
        while self.latencies.len() > LATENCY_SAMPLES {
            self.latencies.pop_front();
        }
        let latency_factor = (1.0 - latency_ms as f64 / 10_000.0).max(0.5);
        self.health = (self.health + 10.0 * latency_factor).min(100.0);
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.health = (self.health - 20.0).max(0.0);
    }

    fn average_latency(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            return None;
        }
        Some(self.latencies.iter().sum::<u64>() as f64 / self.latencies.len() as f64)
    }
}

struct ProviderSlot {
    name: String,
    provider: Arc<dyn TtsProvider>,
    config: ProviderConfig,
    breaker: Arc<CircuitBreaker>,
    metrics: Mutex<ProviderMetrics>,
}

impl ProviderSlot {
    fn health(&self) -> f64 {
        lock(&self.metrics).health
    }
}

pub struct ProviderManager {
    bus: EventBus,
    // Registration order; ranking sorts a snapshot of this per call
    slots: RwLock<Vec<Arc<ProviderSlot>>>,
    disabled: Mutex<HashSet<String>>,
}

impl ProviderManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            slots: RwLock::new(Vec::new()),
            disabled: Mutex::new(HashSet::new()),
        }
    }

    /// Register (or replace) a provider under `name`.
    pub fn register_provider(
        &self,
        name: impl Into<String>,
        provider: Arc<dyn TtsProvider>,
        config: ProviderConfig,
    ) {
        let name = name.into();
        let breaker = CircuitBreaker::new(
            format!("tts-{}", name),
            CircuitBreakerConfig {
                threshold: config.failure_threshold,
                cooldown: config.cooldown,
                half_open_max: config.half_open_max,
            },
        )
        .with_bus(self.bus.clone());

        let slot = Arc::new(ProviderSlot {
            name: name.clone(),
            provider,
            config,
            breaker: Arc::new(breaker),
            metrics: Mutex::new(ProviderMetrics::new()),
        });

        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        match slots.iter_mut().find(|s| s.name == name) {
            Some(existing) => {
                *existing = slot;
                info!(target: "tts.provider", provider = %name, "Replaced provider");
            }
            None => {
                slots.push(slot);
                info!(target: "tts.provider", provider = %name, "Registered provider");
            }
        }
    }

    pub fn unregister_provider(&self, name: &str) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let before = slots.len();
        slots.retain(|s| s.name != name);
        slots.len() != before
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.snapshot().iter().map(|s| s.name.clone()).collect()
    }

    /// Toggle the external "disabled" flag for a provider (e.g. a user setting
    /// that turns the built-in voice off). Applies to names registered later too.
    pub fn set_provider_enabled(&self, name: &str, enabled: bool) {
        let mut disabled = lock(&self.disabled);
        if enabled {
            disabled.remove(name);
        } else {
            disabled.insert(name.to_string());
        }
        info!(target: "tts.provider", provider = %name, enabled, "Provider toggled");
    }

    pub fn is_provider_enabled(&self, name: &str) -> bool {
        !lock(&self.disabled).contains(name)
    }

    pub fn circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.find(name).map(|s| Arc::clone(&s.breaker))
    }

    pub fn health_score(&self, name: &str) -> Option<f64> {
        self.find(name).map(|s| s.health())
    }

    pub fn average_latency(&self, name: &str) -> Option<f64> {
        let slot = self.find(name)?;
        let avg = lock(&slot.metrics).average_latency();
        avg
    }

    fn find(&self, name: &str) -> Option<Arc<ProviderSlot>> {
        self.snapshot().into_iter().find(|s| s.name == name)
    }

    fn snapshot(&self) -> Vec<Arc<ProviderSlot>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Candidate providers for one call, best health first.
    fn ranked(&self, skip: &[String]) -> Vec<Arc<ProviderSlot>> {
        let disabled = lock(&self.disabled).clone();
        let mut scored: Vec<(f64, Arc<ProviderSlot>)> = self
            .snapshot()
            .into_iter()
            .filter(|s| !skip.contains(&s.name) && !disabled.contains(&s.name))
            .map(|s| (s.health(), s))
            .collect();
        // Stable: equal scores keep registration order
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, s)| s).collect()
    }

    /// Synthesize `text` with the best available provider, failing over on error.
    ///
    /// Only an abort or the exhaustion of every candidate surfaces as an error.
    pub async fn speak(&self, text: &str, request: &SpeakRequest) -> Result<AudioOutput> {
        let options = SynthesisOptions {
            voice: request.voice.clone(),
            rate: request.rate,
            pitch: request.pitch,
        };
        let cancel = &request.cancel;
        let mut last_error: Option<TtsError> = None;

        for slot in self.ranked(&request.skip_providers) {
            if !slot.breaker.can_pass() {
                debug!(target: "tts.provider", provider = %slot.name, "Skipping provider - circuit open");
                continue;
            }
            if cancel.is_cancelled() {
                return Err(TtsError::aborted());
            }

            info!(target: "tts.provider", provider = %slot.name, "Trying provider");
            self.bus
                .emit(names::TTS_PROVIDER_SWITCH, json!({ "provider": slot.name }));

            let policy = RetryPolicy::default()
                .with_retries(slot.config.retries)
                .with_base_delay(slot.config.retry_base_delay)
                .with_max_delay(slot.config.retry_max_delay)
                .should_retry(|e| !e.is_abort());

            let provider: &dyn TtsProvider = slot.provider.as_ref();
            let name = slot.name.as_str();
            let opts = &options;
            let started = Instant::now();
            let result = with_retry(
                || async move {
                    let output = provider.synthesize(text, opts, cancel.clone()).await?;
                    match output {
                        AudioOutput::Blob(ref blob) if blob.is_empty() => {
                            Err(TtsError::EmptyResponse(name.to_string()))
                        }
                        other => Ok(other),
                    }
                },
                &policy,
                Some(cancel),
            )
            .await;

            match result {
                Ok(output) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    slot.breaker.record(true);
                    lock(&slot.metrics).record_success(latency_ms);
                    info!(target: "tts.provider", provider = %slot.name, latency_ms, "Provider succeeded");
                    return Ok(output);
                }
                Err(e) if e.is_abort() => return Err(e),
                Err(e) => {
                    slot.breaker.record(false);
                    lock(&slot.metrics).record_failure();
                    warn!(target: "tts.provider", provider = %slot.name, error = %e, "Provider failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(TtsError::AllProvidersFailed))
    }

    pub fn status(&self) -> HashMap<String, ProviderStatus> {
        let disabled = lock(&self.disabled).clone();
        self.snapshot()
            .into_iter()
            .map(|slot| {
                let metrics = lock(&slot.metrics);
                let status = ProviderStatus {
                    name: slot.name.clone(),
                    health_score: metrics.health,
                    circuit_state: slot.breaker.state(),
                    avg_latency_ms: metrics.average_latency(),
                    successes: metrics.successes,
                    failures: metrics.failures,
                    enabled: !disabled.contains(&slot.name),
                };
                (slot.name.clone(), status)
            })
            .collect()
    }

    pub fn reset_all_circuits(&self) {
        for slot in self.snapshot() {
            slot.breaker.reset();
        }
        info!(target: "tts.provider", "All circuits reset");
    }
}
