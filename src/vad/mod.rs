pub mod detector;
pub mod gate;

pub use detector::{EnergyDetector, ScriptedDetector, SpeechDetector};
pub use gate::{GateConfig, SpeechSegment, VadGate};
