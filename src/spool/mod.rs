pub mod manifest;
pub mod recovery;
pub mod spooler;

pub use manifest::{ChunkRecord, GapRecord, SpoolManifest};
pub use recovery::{scan, RecoveredSession};
pub use spooler::{SpoolError, SpoolSummary, Spooler};
