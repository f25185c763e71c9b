use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::alert::AlertConfig;
use crate::cache::CacheConfig;
use crate::lane::LaneConfig;
use crate::provider::ProviderConfig;
use crate::{Result, TtsError};

/// Voice parameters applied when a request does not carry its own
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoiceDefaults {
    pub voice: String,
    pub rate: u32,
    pub pitch: u32,
}

impl Default for VoiceDefaults {
    fn default() -> Self {
        Self {
            voice: env_or("TTS_VOICE", "zh-HK-HiuGaaiNeural".to_string()),
            rate: env_or("TTS_RATE", 160),
            pitch: env_or("TTS_PITCH", 100),
        }
    }
}

/// Every tunable of the TTS core in one place.
///
/// `Default` starts from built-in values, then `TTS_*` environment variables;
/// [`TtsConfig::load`] overlays a TOML file on top of that.
#[derive(Clone, Debug)]
pub struct TtsConfig {
    pub voice: VoiceDefaults,
    pub lane: LaneConfig,
    /// Applied to providers registered without explicit settings
    pub provider: ProviderConfig,
    pub cache: CacheConfig,
    pub alerts: AlertConfig,
    /// Base URL of the cloud synthesis endpoint
    pub cloud_url: Option<String>,
    /// Providers excluded from ranking (e.g. the built-in voice toggle)
    pub disabled_providers: Vec<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        let lane_defaults = LaneConfig::default();
        let provider_defaults = ProviderConfig::default();
        let cache_defaults = CacheConfig::default();
        let alert_defaults = AlertConfig::default();

        Self {
            voice: VoiceDefaults::default(),
            lane: LaneConfig {
                max_queue_size: env_or("TTS_MAX_QUEUE_SIZE", lane_defaults.max_queue_size),
                default_max_age: env_ms("TTS_MAX_AGE_MS", lane_defaults.default_max_age),
            },
            provider: ProviderConfig {
                failure_threshold: env_or(
                    "TTS_FAILURE_THRESHOLD",
                    provider_defaults.failure_threshold,
                ),
                cooldown: env_ms("TTS_CIRCUIT_COOLDOWN_MS", provider_defaults.cooldown),
                half_open_max: env_or("TTS_HALF_OPEN_MAX", provider_defaults.half_open_max),
                retries: env_or("TTS_RETRIES", provider_defaults.retries),
                retry_base_delay: env_ms(
                    "TTS_RETRY_BASE_DELAY_MS",
                    provider_defaults.retry_base_delay,
                ),
                retry_max_delay: env_ms("TTS_RETRY_MAX_DELAY_MS", provider_defaults.retry_max_delay),
            },
            cache: CacheConfig {
                ttl: env_ms("TTS_CACHE_TTL_MS", cache_defaults.ttl),
                max_entries: env_or("TTS_CACHE_MAX_ENTRIES", cache_defaults.max_entries),
                sweep_interval: env_ms("TTS_CACHE_SWEEP_MS", cache_defaults.sweep_interval),
                path: std::env::var("TTS_CACHE_PATH")
                    .ok()
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from),
            },
            alerts: AlertConfig {
                window_size: env_ms("TTS_ALERT_WINDOW_MS", alert_defaults.window_size),
                min_samples: env_or("TTS_ALERT_MIN_SAMPLES", alert_defaults.min_samples),
                error_rate_threshold: env_or(
                    "TTS_ALERT_ERROR_RATE",
                    alert_defaults.error_rate_threshold,
                ),
                cooldown: env_ms("TTS_ALERT_COOLDOWN_MS", alert_defaults.cooldown),
            },
            cloud_url: std::env::var("TTS_API_URL").ok().filter(|s| !s.is_empty()),
            disabled_providers: std::env::var("TTS_DISABLED_PROVIDERS")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

impl TtsConfig {
    /// Load configuration from a TOML file (path via TTS_CONFIG or ./tts.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let path = std::env::var("TTS_CONFIG").unwrap_or_else(|_| "tts.toml".into());
        Self::load_from(&path)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let p = path.as_ref();
        if !p.exists() {
            tracing::info!(target: "tts.config", path = %p.display(), "No TOML config found; using defaults/env");
            return Self::default();
        }
        match fs::read_to_string(p) {
            Ok(s) => match Self::from_toml_str(&s) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(target: "tts.config", error = %e, "Failed to parse TOML; using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(target: "tts.config", error = %e, "Failed to read TOML; using defaults");
                Self::default()
            }
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let overlay: TtsToml = toml::from_str(s).map_err(|e| TtsError::Config(e.to_string()))?;
        Ok(overlay.overlay(Self::default()))
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct TtsToml {
    pub voice: Option<String>,
    pub rate: Option<u32>,
    pub pitch: Option<u32>,
    pub cloud_url: Option<String>,
    pub disabled_providers: Option<Vec<String>>,
    pub lane: Option<LaneToml>,
    pub provider: Option<ProviderToml>,
    pub cache: Option<CacheToml>,
    pub alerts: Option<AlertToml>,
}

impl TtsToml {
    fn overlay(self, mut base: TtsConfig) -> TtsConfig {
        if let Some(v) = self.voice {
            base.voice.voice = v;
        }
        if let Some(v) = self.rate {
            base.voice.rate = v;
        }
        if let Some(v) = self.pitch {
            base.voice.pitch = v;
        }
        if let Some(v) = self.cloud_url {
            base.cloud_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = self.disabled_providers {
            base.disabled_providers = v.into_iter().filter(|p| !p.is_empty()).collect();
        }
        if let Some(l) = self.lane {
            l.apply(&mut base.lane);
        }
        if let Some(p) = self.provider {
            p.apply(&mut base.provider);
        }
        if let Some(c) = self.cache {
            c.apply(&mut base.cache);
        }
        if let Some(a) = self.alerts {
            a.apply(&mut base.alerts);
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct LaneToml {
    pub max_queue_size: Option<usize>,
    pub default_max_age_ms: Option<u64>,
}
impl LaneToml {
    fn apply(self, l: &mut LaneConfig) {
        if let Some(x) = self.max_queue_size {
            l.max_queue_size = x;
        }
        if let Some(x) = self.default_max_age_ms {
            l.default_max_age = Duration::from_millis(x);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ProviderToml {
    pub failure_threshold: Option<u32>,
    pub cooldown_ms: Option<u64>,
    pub half_open_max: Option<u32>,
    pub retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
}
impl ProviderToml {
    fn apply(self, p: &mut ProviderConfig) {
        if let Some(x) = self.failure_threshold {
            p.failure_threshold = x.max(1);
        }
        if let Some(x) = self.cooldown_ms {
            p.cooldown = Duration::from_millis(x);
        }
        if let Some(x) = self.half_open_max {
            p.half_open_max = x.max(1);
        }
        if let Some(x) = self.retries {
            p.retries = x;
        }
        if let Some(x) = self.retry_base_delay_ms {
            p.retry_base_delay = Duration::from_millis(x);
        }
        if let Some(x) = self.retry_max_delay_ms {
            p.retry_max_delay = Duration::from_millis(x);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct CacheToml {
    pub ttl_ms: Option<u64>,
    pub max_entries: Option<usize>,
    pub sweep_interval_ms: Option<u64>,
    pub path: Option<PathBuf>,
}
impl CacheToml {
    fn apply(self, c: &mut CacheConfig) {
        if let Some(x) = self.ttl_ms {
            c.ttl = Duration::from_millis(x);
        }
        if let Some(x) = self.max_entries {
            c.max_entries = x;
        }
        if let Some(x) = self.sweep_interval_ms {
            c.sweep_interval = Duration::from_millis(x);
        }
        if let Some(x) = self.path {
            c.path = (!x.as_os_str().is_empty()).then_some(x);
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct AlertToml {
    pub window_size_ms: Option<u64>,
    pub min_samples: Option<usize>,
    pub error_rate_threshold: Option<f64>,
    pub cooldown_ms: Option<u64>,
}
impl AlertToml {
    fn apply(self, a: &mut AlertConfig) {
        if let Some(x) = self.window_size_ms {
            a.window_size = Duration::from_millis(x);
        }
        if let Some(x) = self.min_samples {
            a.min_samples = x;
        }
        if let Some(x) = self.error_rate_threshold {
            a.error_rate_threshold = x.clamp(0.0, 1.0);
        }
        if let Some(x) = self.cooldown_ms {
            a.cooldown = Duration::from_millis(x);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_replaces_only_given_fields() {
        let base = TtsConfig::default();
        let cfg = TtsConfig::from_toml_str(
            r#"
            voice = "en-US-JennyNeural"
            disabled_providers = ["browser"]

            [lane]
            max_queue_size = 4

            [alerts]
            error_rate_threshold = 1.5
            "#,
        )
        .unwrap();

        assert_eq!(cfg.voice.voice, "en-US-JennyNeural");
        assert_eq!(cfg.voice.rate, base.voice.rate);
        assert_eq!(cfg.lane.max_queue_size, 4);
        assert_eq!(cfg.lane.default_max_age, base.lane.default_max_age);
        assert_eq!(cfg.disabled_providers, vec!["browser".to_string()]);
        assert_eq!(cfg.alerts.error_rate_threshold, 1.0);
        assert_eq!(cfg.cache.max_entries, base.cache.max_entries);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let err = TtsConfig::from_toml_str("lane = 3").unwrap_err();
        assert!(matches!(err, TtsError::Config(_)));
    }
}
