mod config;
use config::NarratorConfig;
use loom_tts::event::names;
use loom_tts::{
    init_tracing, AudioSink, CloudTtsProvider, CommandPlayer, NativeTtsProvider,
    RobustTtsService, SpeakOptions, TtsProvider,
};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

const HELP: &str = "Type text to speak. Prefix with '!' for high priority.\n\
Commands: /stop, /skip, /session, /status, /reset, /quit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info,loom_tts=info,narrator=info");

    info!(target: "narrator", "Starting narrator demo: stdin → lane → providers → player");

    // Load configuration (defaults + env + optional TOML overlay)
    let cfg = NarratorConfig::load();

    let player = CommandPlayer::new(cfg.player.as_deref());
    let sink: Arc<dyn AudioSink> = Arc::new(player);

    let mut builder = RobustTtsService::builder(cfg.tts.clone()).sink(sink);
    if cfg.use_cloud {
        let cloud: Arc<dyn TtsProvider> = Arc::new(CloudTtsProvider::with_config(cfg.cloud_config()));
        builder = builder.provider("cloud", cloud);
    }
    if cfg.use_native {
        let native: Arc<dyn TtsProvider> = Arc::new(NativeTtsProvider::new(None));
        builder = builder.provider("native", native);
    }
    let service = builder.build();
    service.attach_assistant_events();
    service.on_speaking_start(|| info!(target: "narrator", "🔊 speaking"));
    service.on_speaking_end(|| info!(target: "narrator", "🔇 idle"));

    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => {
                info!(target: "narrator", "Shutting down...");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            // EOF: let queued speech finish
            service.lane().wait_idle().await;
            break;
        };
        let line = line.trim();

        match line {
            "" => continue,
            "/quit" => break,
            "/stop" => service.stop(true),
            "/skip" => service.stop(false),
            "/reset" => service.reset_circuits(),
            "/session" => {
                let id = service.start_session(None);
                println!("session: {}", id);
            }
            "/status" => {
                let status = service.status().await;
                println!("{}", serde_json::to_string_pretty(&status)?);
                service.telemetry().print_report();
            }
            text => {
                let (text, options) = match text.strip_prefix('!') {
                    Some(rest) => (rest.trim(), SpeakOptions::high()),
                    None => (text, SpeakOptions::default()),
                };
                if cfg.via_events {
                    let mut payload = serde_json::to_value(&options)?;
                    payload["text"] = json!(text);
                    service.bus().emit(names::ASSISTANT_REPLY, payload);
                } else if !service.speak(text, options) {
                    warn!(target: "narrator", "Nothing to speak");
                }
            }
        }
    }

    service.shutdown();
    Ok(())
}
