pub mod controller;
pub mod events;

pub use controller::{CaptureFactory, SessionController};
pub use events::{Command, SessionId, SessionState, StatusEvent};
