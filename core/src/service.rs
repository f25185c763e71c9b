//! RobustTtsService: the façade over lane, providers, cache, alerts and
//! telemetry.
//!
//! `speak` preprocesses text and enqueues a lane job whose executor tries the
//! audio cache first, then the provider chain, caches a fresh blob and plays
//! it. Voice failures are reported (event, callback, notification with retry)
//! but never surface as errors to the caller: `speak` answers whether the job
//! was accepted and `speak_async` always resolves with the job's outcome.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, AlertStatus, TtsAlertManager};
use crate::cache::{CacheStats, TtsAudioCache};
use crate::config::TtsConfig;
use crate::event::{names, EventBus, Unsubscribe};
use crate::lane::{JobOutcome, JobTicket, LaneActivity, LaneStatus, Priority, SpeechJob, SpeechLane};
use crate::notify::{Notifier, RetryAction, TracingNotifier};
use crate::playback::{AudioSink, SilentSink};
use crate::provider::{
    AudioOutput, ProviderConfig, ProviderManager, ProviderStatus, SpeakRequest, TtsProvider,
};
use crate::telemetry::{TelemetryReport, TtsTelemetry};
use crate::text::preprocess_text;
use crate::util::{lock, now_ms, preview};
use crate::{Result, TtsError};

type Callback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&TtsError) + Send + Sync>;

/// Per-utterance options; unset voice parameters fall back to the config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpeakOptions {
    pub voice: Option<String>,
    pub rate: Option<u32>,
    pub pitch: Option<u32>,
    pub priority: Priority,
    pub skip_if_busy: bool,
    #[serde(skip)]
    pub max_age: Option<Duration>,
    pub session_id: Option<String>,
    pub skip_providers: Vec<String>,
}

impl SpeakOptions {
    pub fn high() -> Self {
        Self {
            priority: Priority::High,
            ..Self::default()
        }
    }
}

/// `assistant:reply` / `assistant:dialogue` payload.
#[derive(Debug, Clone, Deserialize)]
struct AssistantUtterance {
    text: String,
    #[serde(flatten)]
    options: SpeakOptions,
}

/// Diagnostics snapshot across every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub lane: LaneStatus,
    pub providers: HashMap<String, ProviderStatus>,
    pub telemetry: TelemetryReport,
    pub cache: CacheStats,
    pub alerts: AlertStatus,
}

#[derive(Default)]
struct Callbacks {
    speaking_start: Option<Callback>,
    speaking_end: Option<Callback>,
    error: Option<ErrorCallback>,
}

/// Voice parameters resolved at enqueue time.
#[derive(Clone)]
struct Utterance {
    text: String,
    voice: String,
    rate: u32,
    pitch: u32,
    skip_providers: Vec<String>,
}

pub struct RobustTtsService {
    me: Weak<RobustTtsService>,
    config: TtsConfig,
    bus: EventBus,
    lane: SpeechLane,
    providers: ProviderManager,
    cache: Arc<TtsAudioCache>,
    alerts: Arc<TtsAlertManager>,
    telemetry: Arc<TtsTelemetry>,
    sink: Arc<dyn AudioSink>,
    notifier: Arc<dyn Notifier>,
    callbacks: Arc<Mutex<Callbacks>>,
    subscriptions: Mutex<Vec<Unsubscribe>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    session_seq: AtomicU64,
}

/// Builder for [`RobustTtsService`].
pub struct RobustTtsServiceBuilder {
    config: TtsConfig,
    bus: Option<EventBus>,
    sink: Option<Arc<dyn AudioSink>>,
    notifier: Option<Arc<dyn Notifier>>,
    cache: Option<Arc<TtsAudioCache>>,
    providers: Vec<(String, Arc<dyn TtsProvider>, Option<ProviderConfig>)>,
    sweep: bool,
}

impl RobustTtsServiceBuilder {
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn cache(mut self, cache: Arc<TtsAudioCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Register a provider with the configured default settings.
    pub fn provider(mut self, name: impl Into<String>, provider: Arc<dyn TtsProvider>) -> Self {
        self.providers.push((name.into(), provider, None));
        self
    }

    pub fn provider_with(
        mut self,
        name: impl Into<String>,
        provider: Arc<dyn TtsProvider>,
        config: ProviderConfig,
    ) -> Self {
        self.providers.push((name.into(), provider, Some(config)));
        self
    }

    /// Run the periodic cache sweeper (on by default; needs a tokio runtime).
    pub fn sweep_cache(mut self, enabled: bool) -> Self {
        self.sweep = enabled;
        self
    }

    pub fn build(self) -> Arc<RobustTtsService> {
        let bus = self.bus.unwrap_or_default();
        let config = self.config;
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(TtsAudioCache::open(config.cache.clone())));
        let sink = self
            .sink
            .unwrap_or_else(|| SilentSink::new() as Arc<dyn AudioSink>);
        let notifier = self
            .notifier
            .unwrap_or_else(|| TracingNotifier::new() as Arc<dyn Notifier>);

        let providers = ProviderManager::new(bus.clone());
        for (name, provider, cfg) in self.providers {
            providers.register_provider(name, provider, cfg.unwrap_or_else(|| config.provider.clone()));
        }
        for name in &config.disabled_providers {
            providers.set_provider_enabled(name, false);
        }

        let lane = SpeechLane::new(bus.clone(), config.lane.clone());
        let alerts = TtsAlertManager::new(bus.clone(), config.alerts.clone());
        let telemetry = TtsTelemetry::new();
        let callbacks: Arc<Mutex<Callbacks>> = Arc::default();

        let mut subscriptions = alerts.attach();
        subscriptions.extend(telemetry.attach(&bus));

        {
            let callbacks = callbacks.clone();
            lane.on_state_change(move |activity| {
                let cb = {
                    let cbs = lock(&callbacks);
                    match activity {
                        LaneActivity::Playing => cbs.speaking_start.clone(),
                        LaneActivity::Idle => cbs.speaking_end.clone(),
                    }
                };
                if let Some(cb) = cb {
                    cb();
                }
            });
        }

        {
            let notifier = notifier.clone();
            alerts.on_alert(move |alert| {
                if matches!(alert, Alert::HighErrorRate { .. }) {
                    notifier.show_alert(alert);
                }
            });
        }

        {
            let notifier = notifier.clone();
            subscriptions.push(bus.on(names::TTS_CIRCUIT_OPEN, move |event| {
                let name = event
                    .payload
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let cooldown = event
                    .payload
                    .get("cooldownMs")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                notifier.show_circuit_open(
                    name.strip_prefix("tts-").unwrap_or(name),
                    Duration::from_millis(cooldown),
                );
            }));
        }

        let sweeper = if self.sweep && tokio::runtime::Handle::try_current().is_ok() {
            Some(cache.spawn_sweeper())
        } else {
            None
        };

        info!(
            target: "tts.service",
            providers = ?providers.provider_names(),
            cache = cache.backend(),
            "TTS service ready"
        );

        Arc::new_cyclic(|me| RobustTtsService {
            me: me.clone(),
            config,
            bus,
            lane,
            providers,
            cache,
            alerts,
            telemetry,
            sink,
            notifier,
            callbacks,
            subscriptions: Mutex::new(subscriptions),
            sweeper: Mutex::new(sweeper),
            session_seq: AtomicU64::new(1),
        })
    }
}

impl RobustTtsService {
    pub fn builder(config: TtsConfig) -> RobustTtsServiceBuilder {
        RobustTtsServiceBuilder {
            config,
            bus: None,
            sink: None,
            notifier: None,
            cache: None,
            providers: Vec::new(),
            sweep: true,
        }
    }

    /// Queue `text` for playback. Returns whether the job was accepted.
    pub fn speak(&self, text: &str, options: SpeakOptions) -> bool {
        self.enqueue_speech(text, options).is_some()
    }

    /// Like [`speak`](Self::speak) but hands back the job's ticket.
    pub fn enqueue_speech(&self, text: &str, options: SpeakOptions) -> Option<JobTicket> {
        if text.trim().is_empty() {
            return None;
        }
        let clean = preprocess_text(text);
        if clean.is_empty() {
            debug!(target: "tts.service", "Nothing speakable after preprocessing");
            return None;
        }

        let utterance = Utterance {
            text: clean.clone(),
            voice: options
                .voice
                .clone()
                .unwrap_or_else(|| self.config.voice.voice.clone()),
            rate: options.rate.unwrap_or(self.config.voice.rate),
            pitch: options.pitch.unwrap_or(self.config.voice.pitch),
            skip_providers: options.skip_providers.clone(),
        };

        let me = self.me.clone();
        let raw_text = text.to_string();
        let retry_options = options.clone();
        let mut job = SpeechJob::new(clean, move |cancel| async move {
            match me.upgrade() {
                Some(service) => {
                    service
                        .run_job(utterance, raw_text, retry_options, cancel)
                        .await
                }
                None => Err(TtsError::Aborted("TTS service shut down".into())),
            }
        })
        .with_priority(options.priority)
        .skip_if_busy(options.skip_if_busy);
        if let Some(max_age) = options.max_age {
            job = job.with_max_age(max_age);
        }
        if let Some(session) = options.session_id {
            job = job.with_session(session);
        }

        self.lane.enqueue(job)
    }

    /// Speak and wait for the utterance to finish, whatever the outcome.
    ///
    /// Never fails: a voice failure must not break the caller's task flow.
    pub async fn speak_async(&self, text: &str, options: SpeakOptions) -> JobOutcome {
        match self.enqueue_speech(text, options) {
            Some(ticket) => ticket.outcome().await,
            None => JobOutcome::Rejected,
        }
    }

    async fn run_job(
        &self,
        utterance: Utterance,
        raw_text: String,
        options: SpeakOptions,
        cancel: CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        let result = self.synthesize_and_play(&utterance, cancel).await;
        match &result {
            Ok(()) => self.telemetry.record_latency(started.elapsed()),
            Err(e) if e.is_abort() => {
                debug!(target: "tts.service", text = %preview(&utterance.text, 30), "Speech aborted")
            }
            Err(e) => {
                error!(target: "tts.service", error = %e, text = %preview(&utterance.text, 30), "Speak failed");
                self.report_error(e, raw_text, options);
            }
        }
        result
    }

    async fn synthesize_and_play(
        &self,
        utterance: &Utterance,
        cancel: CancellationToken,
    ) -> Result<()> {
        let Utterance {
            text,
            voice,
            rate,
            pitch,
            skip_providers,
        } = utterance;

        if let Some(blob) = self.cache.get(text, voice, *rate, *pitch).await {
            debug!(target: "tts.service", bytes = blob.size(), "Playing cached audio");
            return self.sink.play(&blob, cancel).await;
        }

        let request = SpeakRequest {
            voice: Some(voice.clone()),
            rate: Some(*rate),
            pitch: Some(*pitch),
            skip_providers: skip_providers.clone(),
            cancel: cancel.clone(),
        };
        match self.providers.speak(text, &request).await? {
            AudioOutput::Blob(blob) => {
                self.cache.put(text, voice, *rate, *pitch, &blob).await;
                self.sink.play(&blob, cancel).await
            }
            // Engine already produced the sound
            AudioOutput::Spoken => Ok(()),
        }
    }

    fn report_error(&self, error: &TtsError, text: String, options: SpeakOptions) {
        let on_error = lock(&self.callbacks).error.clone();
        if let Some(cb) = on_error {
            cb(error);
        }

        let me = self.me.clone();
        let handle = tokio::runtime::Handle::try_current().ok();
        let retry: RetryAction = Arc::new(move || {
            let Some(service) = me.upgrade() else {
                return;
            };
            let _guard = handle.as_ref().map(|h| h.enter());
            info!(target: "tts.service", "Retrying speech on user request");
            service.speak(&text, options.clone());
        });
        self.notifier.show_error(error, retry);
    }

    /// Stop playback; with `clear_queue`, drop every pending job as well.
    ///
    /// `on_speaking_end` fires once the lane actually goes idle, not here.
    pub fn stop(&self, clear_queue: bool) {
        self.lane.stop(clear_queue);
        self.sink.halt();
    }

    /// Begin a new speech session; queued speech from older sessions is
    /// discarded when it reaches the head of the queue.
    pub fn start_session(&self, id: Option<String>) -> String {
        let id = id.unwrap_or_else(|| {
            format!(
                "session-{}-{}",
                now_ms(),
                self.session_seq.fetch_add(1, Ordering::Relaxed)
            )
        });
        self.lane.set_session_id(Some(id.clone()));
        id
    }

    pub fn end_session(&self) {
        self.lane.set_session_id(None);
    }

    pub fn is_playing(&self) -> bool {
        self.lane.is_busy()
    }

    pub async fn status(&self) -> ServiceStatus {
        ServiceStatus {
            lane: self.lane.status(),
            providers: self.providers.status(),
            telemetry: self.telemetry.report(),
            cache: self.cache.stats().await,
            alerts: self.alerts.status(),
        }
    }

    pub fn on_speaking_start<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.callbacks).speaking_start = Some(Arc::new(callback));
    }

    pub fn on_speaking_end<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.callbacks).speaking_end = Some(Arc::new(callback));
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&TtsError) + Send + Sync + 'static,
    {
        lock(&self.callbacks).error = Some(Arc::new(callback));
    }

    /// Speak whatever the dialogue layer publishes on `assistant:reply` and
    /// `assistant:dialogue`.
    pub fn attach_assistant_events(&self) {
        let mut subs = Vec::with_capacity(2);
        for name in [names::ASSISTANT_REPLY, names::ASSISTANT_DIALOGUE] {
            let me = self.me.clone();
            subs.push(self.bus.on(name, move |event| {
                let Some(service) = me.upgrade() else {
                    return;
                };
                match serde_json::from_value::<AssistantUtterance>(event.payload.clone()) {
                    Ok(u) => {
                        if !service.speak(&u.text, u.options) {
                            debug!(target: "tts.service", event = %event.name, "Assistant utterance not queued");
                        }
                    }
                    Err(e) => {
                        warn!(target: "tts.service", event = %event.name, error = %e, "Malformed assistant payload")
                    }
                }
            }));
        }
        lock(&self.subscriptions).extend(subs);
    }

    pub fn register_provider(&self, name: impl Into<String>, provider: Arc<dyn TtsProvider>) {
        self.providers
            .register_provider(name, provider, self.config.provider.clone());
    }

    pub fn set_provider_enabled(&self, name: &str, enabled: bool) {
        self.providers.set_provider_enabled(name, enabled);
    }

    /// Manual recovery: close every provider circuit.
    pub fn reset_circuits(&self) {
        self.providers.reset_all_circuits();
    }

    /// Stop everything and detach from the bus.
    pub fn shutdown(&self) {
        self.stop(true);
        for sub in lock(&self.subscriptions).drain(..) {
            sub.unsubscribe();
        }
        if let Some(handle) = lock(&self.sweeper).take() {
            handle.abort();
        }
        info!(target: "tts.service", "TTS service shut down");
    }

    pub fn config(&self) -> &TtsConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn lane(&self) -> &SpeechLane {
        &self.lane
    }

    pub fn providers(&self) -> &ProviderManager {
        &self.providers
    }

    pub fn cache(&self) -> &Arc<TtsAudioCache> {
        &self.cache
    }

    pub fn alerts(&self) -> &Arc<TtsAlertManager> {
        &self.alerts
    }

    pub fn telemetry(&self) -> &Arc<TtsTelemetry> {
        &self.telemetry
    }
}

impl Drop for RobustTtsService {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.sweeper).take() {
            handle.abort();
        }
    }
}
