use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::vad::SpeechSegment;

use super::engine::{BatchAudio, Transcription, TranscriptionEngine};

/// Terminal state of one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchResult {
    Succeeded(Transcription),
    Failed { reason: String },
}

/// Completion event for one batch, delivered in whatever order batches
/// finish. Batch indices are the only ordering authority downstream.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_index: u64,
    pub result: BatchResult,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum audio per batch before it is closed and submitted.
    pub batch_length: Duration,
    /// Cap on concurrently in-flight submissions (1 for a single-resident
    /// engine; the design supports more for future backends).
    pub max_inflight: usize,
    /// Delay before the single retry of a retryable failure.
    pub retry_delay: Duration,
    pub sample_rate: u32,
}

struct OpenBatch {
    index: u64,
    samples: Vec<i16>,
}

/// Slices the growing segment stream into bounded-duration batches and
/// submits each as an independent task without waiting for results.
/// Indices are strictly increasing; multiple batches may be in flight up to
/// the configured cap.
pub struct BatchDispatcher {
    config: DispatcherConfig,
    engine: Arc<dyn TranscriptionEngine>,
    limiter: Arc<Semaphore>,
    outcome_tx: mpsc::Sender<BatchOutcome>,
    open: Option<OpenBatch>,
    next_index: u64,
    tasks: Vec<JoinHandle<()>>,
    finalized: bool,
}

impl BatchDispatcher {
    pub fn new(
        config: DispatcherConfig,
        engine: Arc<dyn TranscriptionEngine>,
        outcome_tx: mpsc::Sender<BatchOutcome>,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_inflight.max(1)));
        Self {
            config,
            engine,
            limiter,
            outcome_tx,
            open: None,
            next_index: 0,
            tasks: Vec::new(),
            finalized: false,
        }
    }

    fn batch_capacity_samples(&self) -> usize {
        (self.config.sample_rate as u128 * self.config.batch_length.as_millis() / 1000) as usize
    }

    /// Accumulate a closed speech segment. A segment longer than the batch
    /// length is split across consecutive batches so a continuous half-hour
    /// utterance still transcribes incrementally.
    pub fn push_segment(&mut self, segment: SpeechSegment) {
        if self.finalized {
            // The controller drains all segments before finalizing, so this
            // only fires on a caller ordering bug.
            warn!(
                start_seq = segment.start_seq,
                "segment arrived after finalize; ignoring"
            );
            return;
        }
        debug!(
            start_seq = segment.start_seq,
            end_seq = segment.end_seq,
            "segment accepted ({} ms)",
            segment.duration_ms(self.config.sample_rate)
        );

        let capacity = self.batch_capacity_samples();
        let mut remaining = segment.samples.as_slice();

        while !remaining.is_empty() {
            let open = self.open.get_or_insert_with(|| OpenBatch {
                index: self.next_index,
                samples: Vec::new(),
            });
            let room = capacity.saturating_sub(open.samples.len());
            let take = room.min(remaining.len());
            open.samples.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];

            if open.samples.len() >= capacity {
                self.close_and_submit();
            }
        }
    }

    /// Close the open batch (session entering finalize) and return the total
    /// number of batches this session produced.
    pub fn finalize(&mut self) -> u64 {
        self.finalized = true;
        if self.open.as_ref().is_some_and(|b| !b.samples.is_empty()) {
            self.close_and_submit();
        } else {
            self.open = None;
        }
        self.next_index
    }

    /// Number of batches closed so far.
    pub fn batches_closed(&self) -> u64 {
        self.next_index
    }

    /// Abort any submissions still running (hard-exit path after the drain
    /// timeout has already marked them failed).
    pub fn abort_inflight(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn close_and_submit(&mut self) {
        let Some(batch) = self.open.take() else {
            return;
        };
        self.next_index = batch.index + 1;

        let audio = BatchAudio {
            batch_index: batch.index,
            samples: batch.samples,
            sample_rate: self.config.sample_rate,
        };
        info!(
            batch = audio.batch_index,
            "batch closed ({:.1}s), submitting",
            audio.duration_ms() as f64 / 1000.0
        );

        let engine = Arc::clone(&self.engine);
        let limiter = Arc::clone(&self.limiter);
        let outcome_tx = self.outcome_tx.clone();
        let retry_delay = self.config.retry_delay;

        let task = tokio::spawn(async move {
            let index = audio.batch_index;
            // The cap bounds engine pressure; batches queue here, pending.
            let _permit = limiter
                .acquire_owned()
                .await
                .expect("batch limiter never closes");
            debug!(batch = index, "batch in flight");

            let result = match engine.submit(audio.clone()).await {
                Ok(t) => BatchResult::Succeeded(t),
                Err(e) if e.is_retryable() => {
                    warn!(batch = index, "submission failed, retrying once: {e}");
                    tokio::time::sleep(retry_delay).await;
                    match engine.submit(audio).await {
                        Ok(t) => BatchResult::Succeeded(t),
                        Err(e) => {
                            warn!(batch = index, "retry failed: {e}");
                            BatchResult::Failed {
                                reason: e.to_string(),
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(batch = index, "submission failed fatally: {e}");
                    BatchResult::Failed {
                        reason: e.to_string(),
                    }
                }
            };

            let _ = outcome_tx
                .send(BatchOutcome {
                    batch_index: index,
                    result,
                })
                .await;
        });
        self.tasks.push(task);
    }
}
