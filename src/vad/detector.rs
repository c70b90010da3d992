use std::collections::VecDeque;

/// Per-frame binary speech classifier.
///
/// Deliberately stateless across frames: all hysteresis lives in the gate,
/// so detectors stay trivially swappable and the gate's state machine stays
/// the single ordering authority.
pub trait SpeechDetector: Send {
    fn is_speech(&mut self, samples: &[i16]) -> bool;
}

/// RMS energy detector with webrtcvad-style aggressiveness levels.
///
/// Higher aggressiveness means a higher energy bar before a frame counts as
/// speech, i.e. more frames classified as silence.
pub struct EnergyDetector {
    threshold: f32,
}

impl EnergyDetector {
    pub fn new(aggressiveness: u8) -> Self {
        let threshold = match aggressiveness {
            0 => 0.004,
            1 => 0.008,
            2 => 0.015,
            _ => 0.030,
        };
        Self { threshold }
    }

    fn rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_squares: f32 = samples
            .iter()
            .map(|&s| {
                let x = s as f32 / i16::MAX as f32;
                x * x
            })
            .sum();
        (sum_squares / samples.len() as f32).sqrt()
    }
}

impl SpeechDetector for EnergyDetector {
    fn is_speech(&mut self, samples: &[i16]) -> bool {
        Self::rms(samples) > self.threshold
    }
}

/// Detector that replays a fixed classification script, then a default.
/// Lets tests drive the gate deterministically without audio content.
pub struct ScriptedDetector {
    script: VecDeque<bool>,
    default: bool,
}

impl ScriptedDetector {
    pub fn new(script: impl IntoIterator<Item = bool>, default: bool) -> Self {
        Self {
            script: script.into_iter().collect(),
            default,
        }
    }
}

impl SpeechDetector for ScriptedDetector {
    fn is_speech(&mut self, _samples: &[i16]) -> bool {
        self.script.pop_front().unwrap_or(self.default)
    }
}
