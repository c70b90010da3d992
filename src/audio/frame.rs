use std::sync::Arc;

/// Capture format: mono 16-bit PCM at 16 kHz (what speech models expect).
pub const SAMPLE_RATE: u32 = 16_000;
pub const CHANNELS: u16 = 1;

/// A fixed-duration slice of captured audio.
///
/// Sequence numbers increase by exactly 1 while a session is recording; a
/// jump is only ever produced across a pause and is announced by an explicit
/// `FrameEvent::Gap`. Timestamps are derived from the sequence number, never
/// from wall clock, so ordering is deterministic under replay.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Monotonic per-session sequence number.
    pub seq: u64,
    /// Milliseconds since the session started (`seq * frame_duration_ms`).
    pub timestamp_ms: u64,
    /// Raw samples (i16 PCM, mono).
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn duration_ms(&self) -> u64 {
        self.samples.len() as u64 * 1000 / SAMPLE_RATE as u64
    }
}

/// Events published on the capture fan-out bus.
///
/// The VAD gate and the spooler subscribe to the same ordered stream; each
/// consumer drains at its own pace and drops its own oldest entries when it
/// lags, without slowing the producer or the other consumer.
#[derive(Debug, Clone)]
pub enum FrameEvent {
    /// A live captured frame.
    Frame(Arc<AudioFrame>),
    /// Sequence gap across a pause interval. `last_seq` is the last frame
    /// published before the pause, `next_seq` the first one after it.
    Gap { last_seq: u64, next_seq: u64 },
    /// Force-close boundary: pause, stop, or device loss. Consumers must
    /// close any open segment or partial chunk.
    Flush,
}
