pub mod dispatcher;
pub mod engine;

pub use dispatcher::{BatchDispatcher, BatchOutcome, BatchResult, DispatcherConfig};
pub use engine::{BatchAudio, EngineError, StubEngine, Transcription, TranscriptionEngine, WordTiming};
