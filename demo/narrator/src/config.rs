use std::fs;
use std::path::Path;

use loom_tts::providers::cloud::CloudConfig;
use loom_tts::TtsConfig;
use serde::Deserialize;

/// High-level configuration for the narrator demo
#[derive(Clone, Debug)]
pub struct NarratorConfig {
    pub tts: TtsConfig,
    /// Preferred player binary (ffplay, paplay, aplay, mpg123)
    pub player: Option<String>,
    pub use_cloud: bool,
    pub use_native: bool,
    /// Publish input as `assistant:reply` events instead of calling `speak`
    pub via_events: bool,
}

impl Default for NarratorConfig {
    fn default() -> Self {
        Self {
            tts: TtsConfig::default(),
            player: std::env::var("NARRATOR_PLAYER").ok().filter(|s| !s.is_empty()),
            use_cloud: true,
            use_native: true,
            via_events: std::env::var("NARRATOR_VIA_EVENTS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

impl NarratorConfig {
    /// Load from NARRATOR_CONFIG or ./narrator.toml, overlaying defaults and env.
    /// The TTS core reads its own section from TTS_CONFIG / ./tts.toml.
    pub fn load() -> Self {
        let default = Self {
            tts: TtsConfig::load(),
            ..Self::default()
        };
        let path = std::env::var("NARRATOR_CONFIG").unwrap_or_else(|_| "narrator.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "narrator", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<NarratorToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target: "narrator", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "narrator", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    pub fn cloud_config(&self) -> CloudConfig {
        let mut cloud = CloudConfig::default();
        if let Some(url) = &self.tts.cloud_url {
            cloud.base_url = url.clone();
        }
        cloud.default_voice = self.tts.voice.voice.clone();
        cloud.default_rate = self.tts.voice.rate;
        cloud.default_pitch = self.tts.voice.pitch;
        cloud
    }
}

#[derive(Debug, Default, Deserialize)]
struct NarratorToml {
    player: Option<String>,
    use_cloud: Option<bool>,
    use_native: Option<bool>,
    via_events: Option<bool>,
}

impl NarratorToml {
    fn overlay(self, mut base: NarratorConfig) -> NarratorConfig {
        if let Some(v) = self.player.filter(|s| !s.is_empty()) {
            base.player = Some(v);
        }
        if let Some(v) = self.use_cloud {
            base.use_cloud = v;
        }
        if let Some(v) = self.use_native {
            base.use_native = v;
        }
        if let Some(v) = self.via_events {
            base.via_events = v;
        }
        base
    }
}
