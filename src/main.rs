use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use scribed::audio::{CaptureBackendFactory, CaptureSource};
use scribed::batch::StubEngine;
use scribed::delivery::{DeliveryChannel, DropFileChannel, MemoryChannel};
use scribed::{Command, Config, SessionController, StatusEvent};

#[derive(Parser, Debug)]
#[command(name = "scribed", about = "Crash-safe local dictation service", version)]
struct Args {
    /// Config file (TOML, extension optional). Defaults apply when missing.
    #[arg(short, long, default_value = "config/scribed")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;
    info!(config = %args.config, "scribed starting");

    let engine = Arc::new(StubEngine::with_delay(Duration::from_millis(250)));
    let channel: Box<dyn DeliveryChannel> = match &cfg.delivery.drop_file {
        Some(path) => Box::new(DropFileChannel::new(path.clone())),
        None => Box::new(MemoryChannel::default()),
    };

    let (event_tx, mut event_rx) = mpsc::channel(64);
    let controller = SessionController::new(
        cfg,
        engine,
        Box::new(|| CaptureBackendFactory::create(CaptureSource::Microphone)),
        channel,
        event_tx,
    )?;

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let controller_task = tokio::spawn(controller.run(cmd_rx));

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                StatusEvent::RecordingStarted { session } => {
                    info!(%session, "recording started");
                }
                StatusEvent::RecordingPaused { session } => {
                    info!(%session, "recording paused");
                }
                StatusEvent::RecordingResumed { session } => {
                    info!(%session, "recording resumed");
                }
                StatusEvent::TranscriptionComplete {
                    session, batches, ..
                } => {
                    info!(%session, batches, "transcription complete");
                }
                StatusEvent::RecoverableSessionFound {
                    session,
                    duration_secs,
                } => {
                    info!(
                        %session,
                        "found recoverable session ({duration_secs:.1}s); \
                         type `recover` to resume or `discard` to drop it"
                    );
                }
                StatusEvent::DeliveryFellBackToFile { path } => {
                    warn!(path = %path.display(), "transcript saved to fallback file");
                }
            }
        }
    });

    info!("commands: start | pause | unload | recover | discard | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let cmd = match line.trim() {
            "start" | "stop" | "toggle" => Command::StartOrToggle,
            "pause" | "resume" => Command::PauseResume,
            "unload" | "reload" => Command::UnloadReload,
            "recover" | "yes" => Command::RecoverResume,
            "discard" | "no" => Command::RecoverDiscard,
            "quit" | "exit" => Command::Exit,
            "" => continue,
            other => {
                warn!(%other, "unknown command");
                continue;
            }
        };
        let is_exit = cmd == Command::Exit;
        if cmd_tx.send(cmd).await.is_err() {
            break;
        }
        if is_exit {
            break;
        }
    }
    drop(cmd_tx);

    controller_task.await??;
    info!("scribed stopped");
    Ok(())
}
