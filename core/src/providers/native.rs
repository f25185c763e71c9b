//! Local CLI synthesis with graceful engine selection:
//! - Prefer Piper (higher quality, requires voice model)
//! - Fallback to espeak-ng (widely available)
//! - If neither is present the provider reports itself unavailable
//!
//! Engines run as child processes that are killed on cancel or timeout.
//!
//! Env overrides:
//! - PIPER_BIN, PIPER_VOICE, PIPER_VOICE_DIR
//! - ESPEAK_BIN
//! - TTS_TIMEOUT_MS, TTS_TEMP_DIR

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::{AudioBlob, AudioOutput, SynthesisOptions, TtsProvider};
use crate::util::{gen_id, get_from_env_or_path, get_from_path};
use crate::{Result, TtsError};

const PROVIDER: &str = "native";
/// Rate the voice defaults are expressed in (words per minute)
const BASE_WPM: f32 = 160.0;

#[derive(Clone, Debug)]
pub struct NativeConfig {
    pub temp_dir: PathBuf,
    pub timeout_ms: u64,
    pub sample_rate: u32,
    pub piper_bin: Option<PathBuf>,
    pub piper_voice: Option<PathBuf>,
    pub piper_voice_dir: Option<PathBuf>,
    pub espeak_bin: Option<PathBuf>,
}

impl Default for NativeConfig {
    fn default() -> Self {
        let temp_dir = std::env::var("TTS_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        let timeout_ms = std::env::var("TTS_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(20_000);

        Self {
            temp_dir,
            timeout_ms,
            sample_rate: 16_000,
            piper_bin: get_from_env_or_path("PIPER_BIN", "piper"),
            piper_voice: std::env::var("PIPER_VOICE").ok().map(PathBuf::from),
            piper_voice_dir: std::env::var("PIPER_VOICE_DIR").ok().map(PathBuf::from),
            espeak_bin: get_from_env_or_path("ESPEAK_BIN", "espeak-ng")
                .or_else(|| get_from_path("espeak")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Engine {
    Piper,
    Espeak,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Piper => "piper",
            Engine::Espeak => "espeak-ng",
        }
    }
}

pub struct NativeTtsProvider {
    cfg: NativeConfig,
}

impl NativeTtsProvider {
    pub fn new(cfg: Option<NativeConfig>) -> Self {
        let cfg = cfg.unwrap_or_default();
        // Log detected engines once
        if let Some(ref p) = cfg.piper_bin {
            info!(target: "tts.native", bin = ?p, "Detected Piper binary");
        }
        if let Some(ref e) = cfg.espeak_bin {
            info!(target: "tts.native", bin = ?e, "Detected espeak-ng binary");
        }
        Self { cfg }
    }

    pub fn engine(&self) -> Option<Engine> {
        if self.cfg.piper_bin.is_some() && self.cfg.piper_voice.is_some() {
            return Some(Engine::Piper);
        }
        if self.cfg.espeak_bin.is_some() {
            return Some(Engine::Espeak);
        }
        if self.cfg.piper_bin.is_some() && self.cfg.piper_voice_dir.is_some() {
            return Some(Engine::Piper);
        }
        None
    }
}

#[async_trait]
impl TtsProvider for NativeTtsProvider {
    async fn synthesize(
        &self,
        text: &str,
        options: &SynthesisOptions,
        cancel: CancellationToken,
    ) -> Result<AudioOutput> {
        let engine = self
            .engine()
            .ok_or_else(|| TtsError::Unavailable("no local TTS engine (piper/espeak-ng)".into()))?;

        let voice = options.voice.clone().unwrap_or_default();
        let speed = options.rate.map(|r| r as f32 / BASE_WPM).unwrap_or(1.0);
        let wav_path = self.cfg.temp_dir.join(format!("tts_{}.wav", gen_id()));

        let (cmd, stdin_text) = match engine {
            Engine::Piper => (piper_command(&self.cfg, &voice, speed, &wav_path)?, Some(text)),
            Engine::Espeak => (espeak_command(&self.cfg, &voice, speed, text, &wav_path)?, None),
        };

        let result = run_engine(
            engine,
            cmd,
            stdin_text,
            cancel,
            Duration::from_millis(self.cfg.timeout_ms),
        )
        .await;
        let bytes = match result {
            Ok(()) => tokio::fs::read(&wav_path).await,
            Err(e) => {
                let _ = tokio::fs::remove_file(&wav_path).await;
                return Err(e);
            }
        };
        let _ = tokio::fs::remove_file(&wav_path).await;
        let bytes = bytes?;

        if bytes.is_empty() {
            return Err(TtsError::EmptyResponse(PROVIDER.to_string()));
        }
        debug!(target: "tts.native", engine = engine.as_str(), bytes = bytes.len(), "Synthesized");
        Ok(AudioOutput::Blob(AudioBlob::new(bytes, "audio/wav")))
    }
}

/// Run an engine to completion. The child is killed on cancel or timeout.
async fn run_engine(
    engine: Engine,
    mut cmd: Command,
    stdin_text: Option<&str>,
    cancel: CancellationToken,
    limit: Duration,
) -> Result<()> {
    cmd.stdin(if stdin_text.is_some() { Stdio::piped() } else { Stdio::null() });
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    debug!(target: "tts.native", command = ?cmd, engine = engine.as_str(), "Running engine");

    let mut child = cmd.spawn()?;
    if let (Some(text), Some(mut stdin)) = (stdin_text, child.stdin.take()) {
        let input = text.as_bytes().to_vec();
        // Dropping stdin at the end closes it so the engine sees end of input
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&input).await {
                debug!(target: "tts.native", error = %e, "Engine closed stdin early");
            }
        });
    }

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            debug!(target: "tts.native", engine = engine.as_str(), "Synthesis cancelled");
            return Err(TtsError::aborted());
        }
        _ = tokio::time::sleep(limit) => {
            let _ = child.kill().await;
            warn!(target: "tts.native", engine = engine.as_str(), timeout_ms = limit.as_millis() as u64, "Engine timed out");
            return Err(TtsError::Timeout(limit.as_millis() as u64));
        }
        status = child.wait() => status?,
    };

    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        return Err(TtsError::provider(
            PROVIDER,
            format!("{} failed: {}", engine.as_str(), stderr.trim()),
        ));
    }
    Ok(())
}

fn resolve_piper_voice_path(cfg: &NativeConfig, voice: &str) -> Option<PathBuf> {
    if let Some(v) = &cfg.piper_voice {
        return Some(v.clone());
    }
    if voice.is_empty() {
        return None;
    }
    let vh = PathBuf::from(voice);
    if vh.exists() {
        return Some(vh);
    }
    if let Some(dir) = &cfg.piper_voice_dir {
        let candidate = dir.join(voice);
        if candidate.exists() {
            return Some(candidate);
        }
        for ext in ["onnx", "onnx.gz"].iter() {
            let c = dir.join(format!("{}.{}", voice, ext));
            if c.exists() {
                return Some(c);
            }
        }
    }
    None
}

fn piper_command(cfg: &NativeConfig, voice: &str, speed: f32, out_wav: &Path) -> Result<Command> {
    let piper = cfg
        .piper_bin
        .as_ref()
        .ok_or_else(|| TtsError::Unavailable("Piper binary not found".into()))?;
    let voice_path = resolve_piper_voice_path(cfg, voice).ok_or_else(|| {
        TtsError::provider(PROVIDER, "Piper voice not found; set PIPER_VOICE or PIPER_VOICE_DIR")
    })?;

    let mut cmd = Command::new(piper);
    cmd.arg("-m").arg(voice_path);
    cmd.arg("-f").arg(out_wav);
    let length_scale = (1.0f32 / speed.max(0.1)).clamp(0.5, 2.0);
    cmd.arg("--length_scale").arg(format!("{:.2}", length_scale));
    cmd.arg("--sample_rate").arg(cfg.sample_rate.to_string());
    Ok(cmd)
}

fn espeak_command(
    cfg: &NativeConfig,
    voice: &str,
    speed: f32,
    text: &str,
    out_wav: &Path,
) -> Result<Command> {
    let espeak = cfg
        .espeak_bin
        .as_ref()
        .ok_or_else(|| TtsError::Unavailable("espeak-ng not found".into()))?;
    let mut cmd = Command::new(espeak);
    let wpm = (BASE_WPM * speed).round().clamp(80.0, 450.0) as i32;
    // Cloud voice names (e.g. zh-HK-HiuGaaiNeural) are not espeak voices
    if !voice.is_empty() && !voice.ends_with("Neural") {
        cmd.arg("-v").arg(voice);
    }
    cmd.arg("-s").arg(wpm.to_string());
    cmd.arg("-w").arg(out_wav);
    cmd.arg(text);
    Ok(cmd)
}
