// Integration tests for the real-time framing task
//
// These tests drive the frame source with hand-fed sample blocks and
// verify reframing, pause gaps and device-loss handling on the bus.

use std::time::Duration;

use anyhow::Result;
use scribed::audio::{CaptureCtl, CaptureNotice, FrameEvent, FrameSource};
use tokio::sync::{broadcast, mpsc};

const FRAME_SAMPLES: usize = 480;
const FRAME_MS: u64 = 30;

struct Harness {
    bus: broadcast::Receiver<FrameEvent>,
    samples: mpsc::Sender<Vec<i16>>,
    ctl: mpsc::Sender<CaptureCtl>,
    notices: mpsc::Receiver<CaptureNotice>,
    task: tokio::task::JoinHandle<()>,
}

fn spawn_source(first_seq: u64) -> Harness {
    let (bus_tx, bus) = broadcast::channel(256);
    let (samples, samples_rx) = mpsc::channel(32);
    let (ctl, ctl_rx) = mpsc::channel(8);
    let (notice_tx, notices) = mpsc::channel(8);
    let task = FrameSource::spawn(
        bus_tx,
        samples_rx,
        FRAME_SAMPLES,
        FRAME_MS,
        first_seq,
        ctl_rx,
        notice_tx,
    );
    Harness {
        bus,
        samples,
        ctl,
        notices,
        task,
    }
}

async fn next_event(rx: &mut broadcast::Receiver<FrameEvent>) -> FrameEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for bus event")
        .expect("bus closed unexpectedly")
}

fn expect_frame(event: FrameEvent, seq: u64) {
    match event {
        FrameEvent::Frame(frame) => {
            assert_eq!(frame.seq, seq);
            assert_eq!(frame.samples.len(), FRAME_SAMPLES);
            assert_eq!(frame.timestamp_ms, seq * FRAME_MS);
        }
        other => panic!("expected frame {seq}, got {other:?}"),
    }
}

#[tokio::test]
async fn test_blocks_are_reframed_with_carry() -> Result<()> {
    let mut h = spawn_source(0);

    // 2.2 frames worth in one block: two frames out, 100 samples carried.
    h.samples.send(vec![7i16; FRAME_SAMPLES * 2 + 100]).await?;
    expect_frame(next_event(&mut h.bus).await, 0);
    expect_frame(next_event(&mut h.bus).await, 1);

    // The carry plus this block completes frame 2.
    h.samples.send(vec![7i16; FRAME_SAMPLES - 100]).await?;
    expect_frame(next_event(&mut h.bus).await, 2);

    h.ctl.send(CaptureCtl::Stop).await?;
    assert!(matches!(next_event(&mut h.bus).await, FrameEvent::Flush));
    assert!(matches!(
        h.bus.recv().await,
        Err(broadcast::error::RecvError::Closed)
    ));
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_pause_numbers_dropped_frames_and_emits_gap() -> Result<()> {
    let mut h = spawn_source(0);

    h.samples.send(vec![0i16; FRAME_SAMPLES * 3]).await?;
    for seq in 0..3 {
        expect_frame(next_event(&mut h.bus).await, seq);
    }

    h.ctl.send(CaptureCtl::Pause).await?;
    assert!(
        matches!(next_event(&mut h.bus).await, FrameEvent::Flush),
        "pause must flush downstream state first"
    );

    // Frames 3 and 4 arrive while paused: numbered, never published.
    h.samples.send(vec![0i16; FRAME_SAMPLES * 2]).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.ctl.send(CaptureCtl::Resume(None)).await?;
    h.samples.send(vec![0i16; FRAME_SAMPLES]).await?;

    match next_event(&mut h.bus).await {
        FrameEvent::Gap { last_seq, next_seq } => {
            assert_eq!(last_seq, 2);
            assert_eq!(next_seq, 5, "sequence numbers kept counting while paused");
        }
        other => panic!("expected gap before first post-resume frame, got {other:?}"),
    }
    expect_frame(next_event(&mut h.bus).await, 5);

    h.ctl.send(CaptureCtl::Stop).await?;
    assert!(matches!(next_event(&mut h.bus).await, FrameEvent::Flush));
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_device_loss_notifies_and_resumes_on_new_stream() -> Result<()> {
    let mut h = spawn_source(0);

    h.samples.send(vec![1i16; FRAME_SAMPLES]).await?;
    expect_frame(next_event(&mut h.bus).await, 0);

    // Backend channel closes mid-stream.
    drop(h.samples);
    assert!(matches!(next_event(&mut h.bus).await, FrameEvent::Flush));
    assert_eq!(h.notices.recv().await, Some(CaptureNotice::DeviceLost));

    // A replacement stream picks up with the next sequence number and an
    // explicit gap announcement.
    let (new_tx, new_rx) = mpsc::channel(32);
    h.ctl.send(CaptureCtl::Resume(Some(new_rx))).await?;
    new_tx.send(vec![2i16; FRAME_SAMPLES]).await?;

    match next_event(&mut h.bus).await {
        FrameEvent::Gap { last_seq, next_seq } => {
            assert_eq!(last_seq, 0);
            assert_eq!(next_seq, 1);
        }
        other => panic!("expected gap after device swap, got {other:?}"),
    }
    expect_frame(next_event(&mut h.bus).await, 1);

    h.ctl.send(CaptureCtl::Stop).await?;
    assert!(matches!(next_event(&mut h.bus).await, FrameEvent::Flush));
    h.task.await?;
    Ok(())
}

#[tokio::test]
async fn test_first_seq_offset_for_recovered_sessions() -> Result<()> {
    let mut h = spawn_source(100);

    h.samples.send(vec![0i16; FRAME_SAMPLES * 2]).await?;
    expect_frame(next_event(&mut h.bus).await, 100);
    expect_frame(next_event(&mut h.bus).await, 101);

    h.ctl.send(CaptureCtl::Stop).await?;
    assert!(matches!(next_event(&mut h.bus).await, FrameEvent::Flush));
    h.task.await?;
    Ok(())
}
