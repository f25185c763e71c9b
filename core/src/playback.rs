//! Audio output boundary.
//!
//! A sink receives a playable blob and completes exactly once: `Ok` when the
//! audio ended, [`TtsError::Aborted`] when cancelled, [`TtsError::Playback`]
//! on output failure.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::AudioBlob;
use crate::util::{gen_id, get_from_path, lock};
use crate::{Result, TtsError};

#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, blob: &AudioBlob, cancel: CancellationToken) -> Result<()>;

    /// Stop whatever is currently playing.
    fn halt(&self);
}

/// Plays blobs through a command-line player (aplay, paplay or ffplay).
pub struct CommandPlayer {
    player: Option<PathBuf>,
    temp_dir: PathBuf,
    current: Mutex<Option<CancellationToken>>,
}

impl CommandPlayer {
    /// `preference` names a player binary to try before the default chain.
    pub fn new(preference: Option<&str>) -> Self {
        let player = select_player(preference);
        match &player {
            Some(p) => info!(target: "tts.playback", bin = ?p, "Detected audio player"),
            None => warn!(target: "tts.playback", "No audio player found; playback will be skipped"),
        }
        let temp_dir = std::env::var("TTS_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        Self {
            player,
            temp_dir,
            current: Mutex::new(None),
        }
    }

    pub fn player(&self) -> Option<&Path> {
        self.player.as_deref()
    }

    async fn run_player(&self, bin: &Path, path: &Path, cancel: CancellationToken) -> Result<()> {
        let mut cmd = Command::new(bin);
        match bin.file_name().and_then(|s| s.to_str()).unwrap_or("") {
            "ffplay" => {
                cmd.arg("-autoexit").arg("-nodisp").arg("-loglevel").arg("quiet");
            }
            "mpg123" => {
                cmd.arg("-q");
            }
            _ => {}
        }
        cmd.arg(path);
        cmd.kill_on_drop(true);
        debug!(target: "tts.playback", command = ?cmd, "Running player");

        let mut child = cmd
            .spawn()
            .map_err(|e| TtsError::Playback(format!("failed to start player: {}", e)))?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| TtsError::Playback(e.to_string()))?;
                if status.success() {
                    Ok(())
                } else {
                    Err(TtsError::Playback(format!("player exited with {}", status)))
                }
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(TtsError::Aborted("Playback aborted".into()))
            }
        }
    }
}

#[async_trait]
impl AudioSink for CommandPlayer {
    async fn play(&self, blob: &AudioBlob, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(TtsError::Aborted("Playback aborted".into()));
        }
        let Some(bin) = self.player.clone() else {
            info!(target: "tts.playback", bytes = blob.size(), "No audio player; dropping audio");
            return Ok(());
        };

        let path = self
            .temp_dir
            .join(format!("tts_{}.{}", gen_id(), extension_for(&blob.mime_type)));
        tokio::fs::write(&path, &blob.bytes).await?;

        let token = cancel.child_token();
        *lock(&self.current) = Some(token.clone());
        let result = self.run_player(&bin, &path, token).await;
        *lock(&self.current) = None;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(target: "tts.playback", path = ?path, error = %e, "Failed to remove temp audio");
        }
        result
    }

    fn halt(&self) {
        if let Some(token) = lock(&self.current).take() {
            token.cancel();
        }
    }
}

/// Headless sink: "plays" by waiting for an optional fixed duration.
#[derive(Default)]
pub struct SilentSink {
    duration: Duration,
    played: AtomicUsize,
    halt: Mutex<CancellationToken>,
}

impl SilentSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Each playback takes `duration` unless cancelled.
    pub fn with_duration(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            ..Self::default()
        })
    }

    pub fn played(&self) -> usize {
        self.played.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for SilentSink {
    async fn play(&self, _blob: &AudioBlob, cancel: CancellationToken) -> Result<()> {
        let halt = lock(&self.halt).clone();
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {
                self.played.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ = cancel.cancelled() => Err(TtsError::Aborted("Playback aborted".into())),
            _ = halt.cancelled() => Err(TtsError::Aborted("Playback halted".into())),
        }
    }

    fn halt(&self) {
        let mut halt = lock(&self.halt);
        halt.cancel();
        *halt = CancellationToken::new();
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/ogg" => "ogg",
        "audio/webm" => "webm",
        _ => "wav",
    }
}

fn select_player(pref: Option<&str>) -> Option<PathBuf> {
    if let Some(p) = pref.and_then(get_from_path) {
        return Some(p);
    }
    ["ffplay", "paplay", "aplay", "mpg123"]
        .iter()
        .find_map(|name| get_from_path(name))
}
