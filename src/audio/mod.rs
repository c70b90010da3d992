pub mod backend;
pub mod frame;
#[cfg(feature = "mic")]
pub mod mic;
pub mod source;

pub use backend::{CaptureBackend, CaptureBackendFactory, CaptureSource, ScriptedBackend};
pub use frame::{AudioFrame, FrameEvent, CHANNELS, SAMPLE_RATE};
pub use source::{CaptureCtl, CaptureNotice, FrameSource};
