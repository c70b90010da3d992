use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::frame::{AudioFrame, FrameEvent};

/// Control messages for the frame source task.
#[derive(Debug)]
pub enum CaptureCtl {
    /// Keep the device running but stop publishing; dropped frames are
    /// still numbered so the gap is visible on resume.
    Pause,
    /// Resume publishing. Carries a replacement sample stream when the
    /// previous device was lost.
    Resume(Option<mpsc::Receiver<Vec<i16>>>),
    /// Publish a final flush and shut the bus down.
    Stop,
}

/// Out-of-band notices from the capture task to the session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureNotice {
    /// The input device stopped delivering samples mid-stream.
    DeviceLost,
}

/// Real-time framing task.
///
/// Consumes raw sample blocks from a capture backend, reframes them into
/// exact `frame_samples`-sized frames with monotonic sequence numbers, and
/// publishes them on a broadcast bus. The task never waits on consumers:
/// `broadcast::Sender::send` is non-blocking and a lagging receiver loses
/// its own oldest entries only.
pub struct FrameSource;

impl FrameSource {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        bus: broadcast::Sender<FrameEvent>,
        samples_rx: mpsc::Receiver<Vec<i16>>,
        frame_samples: usize,
        frame_duration_ms: u64,
        first_seq: u64,
        ctl_rx: mpsc::Receiver<CaptureCtl>,
        notice_tx: mpsc::Sender<CaptureNotice>,
    ) -> JoinHandle<()> {
        tokio::spawn(run_capture(
            bus,
            samples_rx,
            frame_samples,
            frame_duration_ms,
            first_seq,
            ctl_rx,
            notice_tx,
        ))
    }
}

async fn recv_or_pending(rx: &mut Option<mpsc::Receiver<Vec<i16>>>) -> Option<Vec<i16>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_capture(
    bus: broadcast::Sender<FrameEvent>,
    samples_rx: mpsc::Receiver<Vec<i16>>,
    frame_samples: usize,
    frame_duration_ms: u64,
    first_seq: u64,
    mut ctl_rx: mpsc::Receiver<CaptureCtl>,
    notice_tx: mpsc::Sender<CaptureNotice>,
) {
    let mut samples = Some(samples_rx);
    let mut carry: Vec<i16> = Vec::with_capacity(frame_samples * 2);
    let mut seq = first_seq;
    let mut paused = false;
    // Last seq published before the current pause, pending a Gap event.
    let mut gap_after: Option<u64> = None;

    debug!(first_seq, frame_samples, "frame source started");

    loop {
        tokio::select! {
            biased;

            ctl = ctl_rx.recv() => match ctl {
                Some(CaptureCtl::Pause) => {
                    // Close any open segment/chunk before frames go dark.
                    let _ = bus.send(FrameEvent::Flush);
                    gap_after = Some(seq.saturating_sub(1));
                    paused = true;
                    debug!(last_seq = seq.saturating_sub(1), "capture paused");
                }
                Some(CaptureCtl::Resume(replacement)) => {
                    if let Some(rx) = replacement {
                        samples = Some(rx);
                    }
                    paused = false;
                    debug!(next_seq = seq, "capture resumed");
                }
                Some(CaptureCtl::Stop) | None => {
                    let _ = bus.send(FrameEvent::Flush);
                    info!(last_seq = seq.saturating_sub(1), "frame source stopped");
                    break;
                }
            },

            block = recv_or_pending(&mut samples) => match block {
                Some(block) => {
                    carry.extend_from_slice(&block);
                    while carry.len() >= frame_samples {
                        let rest = carry.split_off(frame_samples);
                        let frame_data = std::mem::replace(&mut carry, rest);
                        let frame = AudioFrame {
                            seq,
                            timestamp_ms: seq * frame_duration_ms,
                            samples: frame_data,
                        };
                        seq += 1;

                        if paused {
                            // Numbered but not published: the jump is what
                            // makes the pause gap explicit downstream.
                            continue;
                        }
                        if let Some(last_seq) = gap_after.take() {
                            let _ = bus.send(FrameEvent::Gap {
                                last_seq,
                                next_seq: frame.seq,
                            });
                        }
                        if bus.send(FrameEvent::Frame(Arc::new(frame))).is_err() {
                            warn!("no frame consumers left; stopping capture");
                            return;
                        }
                    }
                }
                None => {
                    // Device went away mid-stream. Flush so the gate closes
                    // its segment, then let the controller pause the session.
                    let _ = bus.send(FrameEvent::Flush);
                    samples = None;
                    if gap_after.is_none() {
                        gap_after = Some(seq.saturating_sub(1));
                    }
                    warn!(last_seq = seq.saturating_sub(1), "capture device lost");
                    let _ = notice_tx.send(CaptureNotice::DeviceLost).await;
                }
            },
        }
    }
}
