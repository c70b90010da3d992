use tracing::{debug, warn};

use crate::audio::AudioFrame;

use super::detector::SpeechDetector;

/// One spoken utterance: a contiguous, strictly increasing frame range
/// bounded by the gate's trigger-on and trigger-off events. Immutable once
/// the gate closes and emits it.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSegment {
    pub start_seq: u64,
    pub end_seq: u64,
    pub samples: Vec<i16>,
}

impl SpeechSegment {
    pub fn frame_count(&self) -> u64 {
        self.end_seq - self.start_seq + 1
    }

    pub fn duration_ms(&self, sample_rate: u32) -> u64 {
        self.samples.len() as u64 * 1000 / sample_rate as u64
    }
}

/// Trigger thresholds in consecutive frame counts.
#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    /// Consecutive speech frames required to open a segment.
    pub trigger_on_frames: u32,
    /// Consecutive silence frames required to close it (700 ms default
    /// upstream, converted by the caller from ms to frames).
    pub trigger_off_frames: u32,
}

impl GateConfig {
    pub fn from_millis(trigger_on_ms: u64, trigger_off_ms: u64, frame_duration_ms: u64) -> Self {
        let to_frames = |ms: u64| (ms.div_ceil(frame_duration_ms)).max(1) as u32;
        Self {
            trigger_on_frames: to_frames(trigger_on_ms),
            trigger_off_frames: to_frames(trigger_off_ms),
        }
    }
}

enum GateState {
    Silent,
    Voiced,
}

struct OpenSegment {
    start_seq: u64,
    last_seq: u64,
    samples: Vec<i16>,
}

impl OpenSegment {
    fn append(&mut self, frame: &AudioFrame) {
        debug_assert_eq!(frame.seq, self.last_seq + 1, "non-contiguous frame fed to gate");
        self.last_seq = frame.seq;
        self.samples.extend_from_slice(&frame.samples);
    }

    fn close(self) -> SpeechSegment {
        SpeechSegment {
            start_seq: self.start_seq,
            end_seq: self.last_seq,
            samples: self.samples,
        }
    }
}

/// Voice-activity gate: turns a frame stream into discrete speech segments.
///
/// `Silent` → after `trigger_on_frames` consecutive speech frames → `Voiced`
/// (every frame appended to the open segment, including the run observed
/// while still silent) → after `trigger_off_frames` consecutive silence
/// frames → segment emitted, back to `Silent`. The frame that reaches the
/// threshold completes the transition on that frame, not the next.
pub struct VadGate {
    detector: Box<dyn SpeechDetector>,
    config: GateConfig,
    state: GateState,
    speech_run: u32,
    silence_run: u32,
    /// Speech-classified frames seen while still Silent; flushed into the
    /// segment on trigger-on so the utterance keeps its first frames.
    pending: Vec<AudioFrame>,
    open: Option<OpenSegment>,
}

impl VadGate {
    pub fn new(detector: Box<dyn SpeechDetector>, config: GateConfig) -> Self {
        Self {
            detector,
            config,
            state: GateState::Silent,
            speech_run: 0,
            silence_run: 0,
            pending: Vec::new(),
            open: None,
        }
    }

    /// Feed one frame; returns a segment when this frame closes one.
    pub fn push(&mut self, frame: &AudioFrame) -> Option<SpeechSegment> {
        let voiced = self.detector.is_speech(&frame.samples);

        match self.state {
            GateState::Silent => {
                if voiced {
                    self.speech_run += 1;
                    self.pending.push(frame.clone());
                    if self.speech_run >= self.config.trigger_on_frames {
                        self.trigger_on();
                    }
                } else {
                    self.speech_run = 0;
                    self.pending.clear();
                }
                None
            }
            GateState::Voiced => {
                let open = self
                    .open
                    .as_mut()
                    .expect("voiced state always has an open segment");
                open.append(frame);

                if voiced {
                    self.silence_run = 0;
                    None
                } else {
                    self.silence_run += 1;
                    if self.silence_run >= self.config.trigger_off_frames {
                        debug!(silence_frames = self.silence_run, "vad trigger-off");
                        Some(self.close_open())
                    } else {
                        None
                    }
                }
            }
        }
    }

    /// Force-close the open segment, if any: recording stopped, paused, or
    /// a gap interrupted the frame stream. Nothing captured is discarded.
    pub fn force_close(&mut self) -> Option<SpeechSegment> {
        self.pending.clear();
        self.speech_run = 0;
        if self.open.is_some() {
            debug!("force-closing open speech segment");
            Some(self.close_open())
        } else {
            self.state = GateState::Silent;
            self.silence_run = 0;
            None
        }
    }

    /// Reset after a dropped-frame window: an open segment can no longer be
    /// contiguous, so it is closed at the last frame actually seen.
    pub fn on_lag(&mut self, skipped: u64) -> Option<SpeechSegment> {
        warn!(skipped, "vad gate lagged; closing segment at last seen frame");
        self.force_close()
    }

    fn trigger_on(&mut self) {
        let first = &self.pending[0];
        debug!(start_seq = first.seq, "vad trigger-on");
        let mut open = OpenSegment {
            start_seq: first.seq,
            last_seq: first.seq,
            samples: first.samples.clone(),
        };
        for frame in &self.pending[1..] {
            open.append(frame);
        }
        self.pending.clear();
        self.open = Some(open);
        self.state = GateState::Voiced;
        self.speech_run = 0;
        self.silence_run = 0;
    }

    fn close_open(&mut self) -> SpeechSegment {
        self.state = GateState::Silent;
        self.silence_run = 0;
        self.speech_run = 0;
        self.open
            .take()
            .expect("close_open called without an open segment")
            .close()
    }
}
