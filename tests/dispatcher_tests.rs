// Integration tests for the batch dispatcher
//
// These tests verify batch slicing, the retry policy and the in-flight
// concurrency cap against instrumented stand-in engines.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use scribed::batch::{
    BatchAudio, BatchDispatcher, BatchOutcome, BatchResult, DispatcherConfig, EngineError,
    StubEngine, Transcription, TranscriptionEngine,
};
use scribed::vad::SpeechSegment;
use tokio::sync::mpsc;

const SAMPLE_RATE: u32 = 16_000;

fn config(batch_secs: u64, max_inflight: usize) -> DispatcherConfig {
    DispatcherConfig {
        batch_length: Duration::from_secs(batch_secs),
        max_inflight,
        retry_delay: Duration::from_millis(1),
        sample_rate: SAMPLE_RATE,
    }
}

fn segment(sample_count: usize) -> SpeechSegment {
    SpeechSegment {
        start_seq: 0,
        end_seq: (sample_count / 480).max(1) as u64 - 1,
        samples: vec![0i16; sample_count],
    }
}

async fn collect(rx: &mut mpsc::Receiver<BatchOutcome>, n: usize) -> Vec<BatchOutcome> {
    let mut outcomes = Vec::with_capacity(n);
    for _ in 0..n {
        outcomes.push(rx.recv().await.expect("outcome expected"));
    }
    outcomes
}

#[tokio::test]
async fn test_long_segment_splits_across_batches() -> Result<()> {
    // 1 s batches; one continuous 2.5 s utterance must become 3 batches.
    let (tx, mut rx) = mpsc::channel(16);
    let mut dispatcher = BatchDispatcher::new(config(1, 2), Arc::new(StubEngine::default()), tx);

    dispatcher.push_segment(segment(40_000)); // 2.5 s
    let expected = dispatcher.finalize();
    assert_eq!(expected, 3);
    assert_eq!(dispatcher.batches_closed(), 3);

    let mut outcomes = collect(&mut rx, 3).await;
    outcomes.sort_by_key(|o| o.batch_index);
    assert_eq!(
        outcomes.iter().map(|o| o.batch_index).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );

    // The first two batches are full seconds, the last holds the remainder.
    for (outcome, want) in outcomes.iter().zip(["1.0s", "1.0s", "0.5s"]) {
        match &outcome.result {
            BatchResult::Succeeded(t) => assert!(t.text.contains(want), "got {}", t.text),
            other => panic!("batch should succeed, got {other:?}"),
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_small_segments_accumulate_into_one_batch() -> Result<()> {
    let (tx, mut rx) = mpsc::channel(16);
    let mut dispatcher = BatchDispatcher::new(config(10, 1), Arc::new(StubEngine::default()), tx);

    for _ in 0..4 {
        dispatcher.push_segment(segment(4800)); // 0.3 s each
    }
    assert_eq!(dispatcher.batches_closed(), 0, "nothing submitted yet");

    let expected = dispatcher.finalize();
    assert_eq!(expected, 1, "finalize closes the partial batch");

    let outcomes = collect(&mut rx, 1).await;
    assert_eq!(outcomes[0].batch_index, 0);
    Ok(())
}

#[tokio::test]
async fn test_empty_session_produces_no_batches() -> Result<()> {
    let (tx, mut rx) = mpsc::channel(16);
    let mut dispatcher = BatchDispatcher::new(config(10, 1), Arc::new(StubEngine::default()), tx);

    assert_eq!(dispatcher.finalize(), 0);
    assert!(rx.try_recv().is_err(), "no outcome for an empty session");
    Ok(())
}

#[tokio::test]
async fn test_segment_after_finalize_is_ignored() -> Result<()> {
    let (tx, mut rx) = mpsc::channel(16);
    let mut dispatcher = BatchDispatcher::new(config(10, 1), Arc::new(StubEngine::default()), tx);

    assert_eq!(dispatcher.finalize(), 0);
    dispatcher.push_segment(segment(4800));
    assert_eq!(dispatcher.batches_closed(), 0);
    assert!(rx.try_recv().is_err());
    Ok(())
}

/// Engine that fails a configured number of times before succeeding.
struct FlakyEngine {
    calls: AtomicU32,
    failures: u32,
    error: fn(String) -> EngineError,
}

#[async_trait]
impl TranscriptionEngine for FlakyEngine {
    async fn submit(&self, audio: BatchAudio) -> Result<Transcription, EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err((self.error)("induced failure".into()));
        }
        Ok(Transcription {
            text: format!("batch {}", audio.batch_index),
            words: None,
        })
    }
}

#[tokio::test]
async fn test_transient_failure_is_retried_once() -> Result<()> {
    let engine = Arc::new(FlakyEngine {
        calls: AtomicU32::new(0),
        failures: 1,
        error: EngineError::Transient,
    });
    let (tx, mut rx) = mpsc::channel(16);
    let mut dispatcher = BatchDispatcher::new(config(10, 1), engine.clone(), tx);

    dispatcher.push_segment(segment(4800));
    dispatcher.finalize();

    let outcomes = collect(&mut rx, 1).await;
    assert!(matches!(outcomes[0].result, BatchResult::Succeeded(_)));
    assert_eq!(engine.calls.load(Ordering::SeqCst), 2, "one retry");
    Ok(())
}

#[tokio::test]
async fn test_second_failure_marks_batch_failed() -> Result<()> {
    let engine = Arc::new(FlakyEngine {
        calls: AtomicU32::new(0),
        failures: u32::MAX,
        error: EngineError::ResourceExhausted,
    });
    let (tx, mut rx) = mpsc::channel(16);
    let mut dispatcher = BatchDispatcher::new(config(10, 1), engine.clone(), tx);

    dispatcher.push_segment(segment(4800));
    dispatcher.finalize();

    let outcomes = collect(&mut rx, 1).await;
    assert!(matches!(outcomes[0].result, BatchResult::Failed { .. }));
    assert_eq!(
        engine.calls.load(Ordering::SeqCst),
        2,
        "exactly one retry, then give up"
    );
    Ok(())
}

#[tokio::test]
async fn test_fatal_failure_is_not_retried() -> Result<()> {
    let engine = Arc::new(FlakyEngine {
        calls: AtomicU32::new(0),
        failures: u32::MAX,
        error: EngineError::Fatal,
    });
    let (tx, mut rx) = mpsc::channel(16);
    let mut dispatcher = BatchDispatcher::new(config(10, 1), engine.clone(), tx);

    dispatcher.push_segment(segment(4800));
    dispatcher.finalize();

    let outcomes = collect(&mut rx, 1).await;
    assert!(matches!(outcomes[0].result, BatchResult::Failed { .. }));
    assert_eq!(engine.calls.load(Ordering::SeqCst), 1, "fatal means no retry");
    Ok(())
}

/// Engine that records the highest number of concurrent submissions.
struct GaugeEngine {
    current: AtomicUsize,
    max_seen: AtomicUsize,
}

#[async_trait]
impl TranscriptionEngine for GaugeEngine {
    async fn submit(&self, audio: BatchAudio) -> Result<Transcription, EngineError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(Transcription {
            text: format!("batch {}", audio.batch_index),
            words: None,
        })
    }
}

#[tokio::test]
async fn test_inflight_cap_serializes_submissions() -> Result<()> {
    let engine = Arc::new(GaugeEngine {
        current: AtomicUsize::new(0),
        max_seen: AtomicUsize::new(0),
    });
    let (tx, mut rx) = mpsc::channel(16);
    let mut dispatcher = BatchDispatcher::new(config(1, 1), engine.clone(), tx);

    // Three full batches submitted back to back.
    dispatcher.push_segment(segment(48_000));
    let expected = dispatcher.finalize();
    assert_eq!(expected, 3);

    collect(&mut rx, 3).await;
    assert_eq!(
        engine.max_seen.load(Ordering::SeqCst),
        1,
        "cap of 1 means batches never overlap at the engine"
    );
    Ok(())
}

#[tokio::test]
async fn test_unloaded_stub_engine_fails_submissions() -> Result<()> {
    let engine = StubEngine::default();

    assert!(!engine.toggle_loaded().await?, "first toggle unloads");
    let err = engine
        .submit(BatchAudio {
            batch_index: 0,
            samples: vec![0; 1600],
            sample_rate: SAMPLE_RATE,
        })
        .await
        .unwrap_err();
    assert!(!err.is_retryable(), "unloaded model is a fatal error");

    assert!(engine.toggle_loaded().await?, "second toggle reloads");
    assert!(engine
        .submit(BatchAudio {
            batch_index: 0,
            samples: vec![0; 1600],
            sample_rate: SAMPLE_RATE,
        })
        .await
        .is_ok());
    Ok(())
}
