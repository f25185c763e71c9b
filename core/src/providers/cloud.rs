/// Cloud synthesis provider
///
/// POSTs `{text, voice, rate, pitch}` to `{base_url}/api/tts/stream` and
/// returns the binary audio body. A 503 is a structured "unavailable" answer.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::provider::{AudioBlob, AudioOutput, SynthesisOptions, TtsProvider};
use crate::{Result, TtsError};

const PROVIDER: &str = "cloud";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub base_url: String,
    /// Hard per-request timeout, independent of caller cancellation
    pub timeout_ms: u64,
    pub default_voice: String,
    pub default_rate: u32,
    pub default_pitch: u32,
    pub user_agent: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            timeout_ms: 12_000,
            default_voice: "zh-HK-HiuGaaiNeural".to_string(),
            default_rate: 160,
            default_pitch: 100,
            user_agent: "loom-tts/0.1".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StreamRequest<'a> {
    text: &'a str,
    voice: &'a str,
    rate: u32,
    pitch: u32,
    skip_browser: bool,
}

pub struct CloudTtsProvider {
    config: CloudConfig,
    http_client: reqwest::Client,
}

impl CloudTtsProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_config(CloudConfig {
            base_url: base_url.into(),
            ..CloudConfig::default()
        })
    }

    pub fn with_config(config: CloudConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(&config.user_agent)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config,
            http_client,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/tts/stream", self.config.base_url.trim_end_matches('/'))
    }

    async fn request(&self, text: &str, options: &SynthesisOptions) -> Result<AudioOutput> {
        let body = StreamRequest {
            text,
            voice: options
                .voice
                .as_deref()
                .unwrap_or(&self.config.default_voice),
            rate: options.rate.unwrap_or(self.config.default_rate),
            pitch: options.pitch.unwrap_or(self.config.default_pitch),
            skip_browser: false,
        };
        debug!(target: "tts.cloud", url = %self.endpoint(), voice = body.voice, chars = text.chars().count(), "Requesting synthesis");

        let response = self
            .http_client
            .post(self.endpoint())
            .header("X-Priority", "high")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TtsError::Timeout(self.config.timeout_ms)
                } else {
                    TtsError::provider(PROVIDER, format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            warn!(target: "tts.cloud", "Cloud TTS reported unavailable");
            return Err(TtsError::Unavailable(PROVIDER.to_string()));
        }
        if !status.is_success() {
            return Err(TtsError::provider(PROVIDER, format!("HTTP {}", status)));
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();
        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                TtsError::Timeout(self.config.timeout_ms)
            } else {
                TtsError::provider(PROVIDER, format!("body read failed: {}", e))
            }
        })?;
        if bytes.is_empty() {
            return Err(TtsError::EmptyResponse(PROVIDER.to_string()));
        }

        Ok(AudioOutput::Blob(AudioBlob::new(bytes.to_vec(), mime_type)))
    }
}

#[async_trait]
impl TtsProvider for CloudTtsProvider {
    async fn synthesize(
        &self,
        text: &str,
        options: &SynthesisOptions,
        cancel: CancellationToken,
    ) -> Result<AudioOutput> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TtsError::aborted()),
            result = self.request(text, options) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_base_url() {
        let p = CloudTtsProvider::new("http://tts.local:8080/");
        assert_eq!(p.endpoint(), "http://tts.local:8080/api/tts/stream");
    }

    #[tokio::test]
    async fn cancelled_request_aborts() {
        let p = CloudTtsProvider::new("http://127.0.0.1:9");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = p
            .synthesize("hi", &SynthesisOptions::default(), cancel)
            .await
            .unwrap_err();
        assert!(err.is_abort());
    }
}
