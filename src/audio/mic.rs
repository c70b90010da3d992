//! Default input device capture via cpal (behind the `mic` feature).

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::backend::CaptureBackend;
use super::frame::SAMPLE_RATE;

/// Microphone backend.
///
/// cpal streams are not `Send`, so the stream lives on a dedicated thread
/// that parks until `stop()` flips the shutdown flag. The device callback
/// must never block: samples are forwarded with `try_send` and dropped with
/// a warning when the channel is full.
pub struct MicBackend {
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl MicBackend {
    pub fn new() -> Result<Self> {
        Ok(Self {
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        })
    }
}

#[async_trait::async_trait]
impl CaptureBackend for MicBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<Vec<i16>>> {
        let (tx, rx) = mpsc::channel::<Vec<i16>>(64);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        let thread = std::thread::Builder::new()
            .name("scribed-mic".into())
            .spawn(move || {
                let stream = match build_input_stream(tx) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    warn!("failed to start input stream: {e}");
                    return;
                }
                while running.load(Ordering::SeqCst) {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                drop(stream);
            })
            .context("failed to spawn microphone thread")?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("microphone thread exited before opening the device"))??;

        self.thread = Some(thread);
        info!("microphone capture started");
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
        info!("microphone capture stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        "microphone"
    }
}

fn build_input_stream(tx: mpsc::Sender<Vec<i16>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("no default input device available"))?;

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _| {
                let samples: Vec<i16> = data
                    .iter()
                    .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                    .collect();
                if tx.try_send(samples).is_err() {
                    warn!("capture channel full; dropping device block");
                }
            },
            |err| warn!("input stream error: {err}"),
            None,
        )
        .context("failed to open input stream")?;

    Ok(stream)
}
