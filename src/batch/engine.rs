use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Transcription engine failure taxonomy. `ResourceExhausted` and
/// `Transient` are retryable; `Fatal` immediately terminates the batch
/// (never the session).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transcription engine out of resources: {0}")]
    ResourceExhausted(String),
    #[error("transient transcription failure: {0}")]
    Transient(String),
    #[error("fatal transcription failure: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_) | Self::Transient(_))
    }
}

/// Optional word-level timing attached to a transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct WordTiming {
    pub word: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Result of transcribing one batch. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    pub words: Option<Vec<WordTiming>>,
}

/// One bounded-duration unit of audio submitted for transcription.
#[derive(Debug, Clone)]
pub struct BatchAudio {
    pub batch_index: u64,
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl BatchAudio {
    pub fn duration_ms(&self) -> u64 {
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }
}

/// Boundary to the external speech-to-text engine: an opaque black box with
/// bounded latency. The dispatcher's concurrency cap is what protects the
/// engine's single-resident-model constraint.
#[async_trait::async_trait]
pub trait TranscriptionEngine: Send + Sync {
    async fn submit(&self, audio: BatchAudio) -> Result<Transcription, EngineError>;

    /// VRAM unload/reload toggle. Returns whether the model is now loaded.
    /// Submissions racing an unload fail `Fatal` for that batch only.
    async fn toggle_loaded(&self) -> Result<bool, EngineError> {
        Ok(true)
    }
}

/// Deterministic stand-in engine for tests and headless runs: reports the
/// batch duration instead of real text, honors the unload toggle.
pub struct StubEngine {
    loaded: AtomicBool,
    delay: Duration,
}

impl Default for StubEngine {
    fn default() -> Self {
        Self {
            loaded: AtomicBool::new(true),
            delay: Duration::from_millis(0),
        }
    }
}

impl StubEngine {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            loaded: AtomicBool::new(true),
            delay,
        }
    }
}

#[async_trait::async_trait]
impl TranscriptionEngine for StubEngine {
    async fn submit(&self, audio: BatchAudio) -> Result<Transcription, EngineError> {
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(EngineError::Fatal("model is unloaded".into()));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Transcription {
            text: format!(
                "(batch {}: {:.1}s of audio)",
                audio.batch_index,
                audio.duration_ms() as f64 / 1000.0
            ),
            words: None,
        })
    }

    async fn toggle_loaded(&self) -> Result<bool, EngineError> {
        let was = self.loaded.fetch_xor(true, Ordering::SeqCst);
        Ok(!was)
    }
}
