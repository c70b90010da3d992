use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;

use crate::delivery::DeliveryReceipt;

/// Discrete external commands (hotkey/tray collaborators). Delivered as
/// atomic, debounced events; commands invalid in the current state are
/// rejected, not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start a session when idle, stop it when recording or paused.
    StartOrToggle,
    /// Pause when recording, resume when paused.
    PauseResume,
    /// Toggle the transcription engine's model residency.
    UnloadReload,
    /// User chose to resume the recoverable session found at startup.
    RecoverResume,
    /// User chose to discard it; manifest and chunks are deleted.
    RecoverDiscard,
    /// Graceful shutdown: drain in-flight batches up to the timeout.
    Exit,
}

/// Status events for the notification collaborator. Emission never blocks;
/// if the sink is full the event is dropped with a log line.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    RecordingStarted { session: String },
    RecordingPaused { session: String },
    RecordingResumed { session: String },
    TranscriptionComplete {
        session: String,
        batches: u64,
        receipt: Option<DeliveryReceipt>,
    },
    RecoverableSessionFound {
        session: String,
        duration_secs: f64,
    },
    DeliveryFellBackToFile { path: PathBuf },
}

/// Recording lifecycle. Exactly one session may be `Recording` or `Paused`
/// at a time; only the session controller performs transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Recording,
    Paused,
    Finalizing,
    Completed,
    Recovering,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Paused => "paused",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Recovering => "recovering",
        };
        f.write_str(name)
    }
}

/// Session identity: monotonic counter plus creation time. The string form
/// doubles as the spool/archive directory name and sorts chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId {
    pub counter: u64,
    pub started_at: DateTime<Utc>,
}

impl SessionId {
    pub fn new(counter: u64) -> Self {
        Self {
            counter,
            started_at: Utc::now(),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session-{:04}-{}",
            self.counter,
            self.started_at.format("%Y%m%d-%H%M%S")
        )
    }
}
