// Loom TTS Library
// Resilient speech synthesis playback: provider failover, speech lane, audio cache

pub mod alert;
pub mod cache;
pub mod circuit;
pub mod config;
pub mod event;
pub mod lane;
pub mod notify;
pub mod playback;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod service;
pub mod telemetry;
pub mod text;
mod util;

// Export core types
pub use alert::{Alert, AlertConfig, AlertStatus, TtsAlertManager};
pub use cache::{
    AudioStore, CacheConfig, CacheEntry, CacheStats, EntryPredicate, InMemoryAudioStore,
    RocksDbAudioStore, TtsAudioCache,
};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStatus};
pub use config::TtsConfig;
pub use event::{Event, EventBus, EventBusStats, Unsubscribe};
pub use lane::{
    JobOutcome, JobTicket, LaneActivity, LaneConfig, LaneStatus, Priority, SpeechJob, SpeechLane,
};
pub use notify::{Notice, NoticeLevel, Notifier, RetryAction, TracingNotifier};
pub use playback::{AudioSink, CommandPlayer, SilentSink};
pub use provider::{
    AudioBlob, AudioOutput, ProviderConfig, ProviderManager, ProviderStatus, SpeakRequest,
    SynthesisOptions, TtsProvider,
};
pub use providers::{provider_fn, CloudTtsProvider, FnProvider, NativeTtsProvider};
pub use retry::{with_retry, RetryInfo, RetryPolicy};
pub use service::{RobustTtsService, RobustTtsServiceBuilder, ServiceStatus, SpeakOptions};
pub use telemetry::{init_tracing, TelemetryReport, TtsTelemetry};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TtsError {
    /// Cancellation; never retried and never scored against a provider.
    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Empty audio response from {0}")]
    EmptyResponse(String),

    #[error("All TTS providers failed")]
    AllProvidersFailed,

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TtsError {
    pub fn aborted() -> Self {
        TtsError::Aborted("TTS request aborted".to_string())
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, TtsError::Aborted(_))
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        TtsError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TtsError>;
