//! Crash-safe dictation core: capture, voice gating, durable spooling,
//! batch transcription and verified delivery, coordinated by a single
//! session controller.

pub mod archive;
pub mod audio;
pub mod batch;
pub mod config;
pub mod delivery;
pub mod session;
pub mod spool;
pub mod transcript;
pub mod vad;

pub use config::Config;
pub use session::{Command, SessionController, SessionState, StatusEvent};
