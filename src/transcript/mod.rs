pub mod aggregator;

pub use aggregator::{FinalTranscript, ResultAggregator, GAP_MARKER};
