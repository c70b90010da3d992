use std::collections::BTreeMap;

use tracing::warn;

use crate::batch::{BatchOutcome, BatchResult};

/// Placeholder emitted for a batch that could not be transcribed. Failed
/// batches degrade the transcript visibly; they are never silently omitted.
pub const GAP_MARKER: &str = "[inaudible]";

/// The finished, ordered text of one session. Produced exactly once, after
/// every batch index has reached a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalTranscript {
    pub session: String,
    pub batch_count: u64,
    pub text: String,
}

/// Pure ordering/merge over the append-only result set. Performs no I/O.
/// Results arrive in completion order; concatenation is always batch-index
/// order, and assembling the same result set twice yields the same text.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    results: BTreeMap<u64, BatchResult>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal outcome. First result for an index wins; results
    /// are never mutated after creation.
    pub fn insert(&mut self, outcome: BatchOutcome) {
        if self.results.contains_key(&outcome.batch_index) {
            warn!(batch = outcome.batch_index, "duplicate batch outcome ignored");
            return;
        }
        self.results.insert(outcome.batch_index, outcome.result);
    }

    pub fn terminal_count(&self) -> u64 {
        self.results.len() as u64
    }

    /// True once every index in `0..expected` is terminal.
    pub fn is_complete(&self, expected: u64) -> bool {
        (0..expected).all(|i| self.results.contains_key(&i))
    }

    /// Indices in `0..expected` still missing a terminal outcome.
    pub fn missing(&self, expected: u64) -> Vec<u64> {
        (0..expected)
            .filter(|i| !self.results.contains_key(i))
            .collect()
    }

    /// Assemble the final transcript: one position per batch index, gap
    /// markers for failures, joined with single spaces. Requires all
    /// `expected` indices to be terminal.
    pub fn assemble(&self, session: &str, expected: u64) -> FinalTranscript {
        debug_assert!(self.is_complete(expected), "assemble called before completion");

        let mut positions: Vec<&str> = Vec::with_capacity(expected as usize);
        for index in 0..expected {
            match self.results.get(&index) {
                Some(BatchResult::Succeeded(t)) => positions.push(t.text.trim()),
                Some(BatchResult::Failed { .. }) | None => positions.push(GAP_MARKER),
            }
        }

        // Every batch keeps its position, even one that transcribed to
        // nothing; the joined text always has exactly `expected` positions.
        let text = positions.join(" ");

        FinalTranscript {
            session: session.to_string(),
            batch_count: expected,
            text,
        }
    }
}
