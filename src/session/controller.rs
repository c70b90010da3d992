use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::archive;
use crate::audio::{
    AudioFrame, CaptureBackend, CaptureCtl, CaptureNotice, FrameEvent, FrameSource,
};
use crate::batch::{
    BatchDispatcher, BatchOutcome, BatchResult, DispatcherConfig, TranscriptionEngine,
};
use crate::config::Config;
use crate::delivery::{DeliveryChannel, DeliveryReceipt, DeliveryVerifier};
use crate::spool::{self, RecoveredSession, SpoolError, SpoolManifest, SpoolSummary, Spooler};
use crate::transcript::ResultAggregator;
use crate::vad::{EnergyDetector, GateConfig, SpeechSegment, VadGate};

use super::events::{Command, SessionId, SessionState, StatusEvent};

/// Creates a capture backend per recording start (and again after a lost
/// device on resume).
pub type CaptureFactory = Box<dyn Fn() -> Result<Box<dyn CaptureBackend>> + Send>;

/// Everything owned by one live recording session.
struct ActiveSession {
    id: String,
    backend: Box<dyn CaptureBackend>,
    ctl: mpsc::Sender<CaptureCtl>,
    capture_task: JoinHandle<()>,
    notices: Option<mpsc::Receiver<CaptureNotice>>,
    segments: Option<mpsc::Receiver<SpeechSegment>>,
    vad_task: JoinHandle<()>,
    spool_task: Option<JoinHandle<Result<SpoolSummary, SpoolError>>>,
    dispatcher: BatchDispatcher,
    outcomes: Option<mpsc::Receiver<BatchOutcome>>,
    aggregator: ResultAggregator,
    device_lost: bool,
    spool_failed: bool,
    spool_summary: Option<SpoolSummary>,
}

/// Single owner of the recording lifecycle.
///
/// All external commands are serialized through one channel and validated
/// against the current state; components report back through signals the
/// controller reacts to without ever blocking on an individual batch.
pub struct SessionController {
    config: Config,
    engine: Arc<dyn TranscriptionEngine>,
    capture_factory: CaptureFactory,
    channel: Box<dyn DeliveryChannel>,
    verifier: DeliveryVerifier,
    events: mpsc::Sender<StatusEvent>,
    state: SessionState,
    session_counter: u64,
    recovered: Option<RecoveredSession>,
    active: Option<ActiveSession>,
}

enum Tick {
    Command(Option<Command>),
    Segment(Option<SpeechSegment>),
    Notice(Option<CaptureNotice>),
    Outcome(Option<BatchOutcome>),
    SpoolDone(Result<Result<SpoolSummary, SpoolError>, JoinError>),
}

impl SessionController {
    /// Build the controller, scanning the spool root for an unterminated
    /// session from a previous run.
    pub fn new(
        config: Config,
        engine: Arc<dyn TranscriptionEngine>,
        capture_factory: CaptureFactory,
        channel: Box<dyn DeliveryChannel>,
        events: mpsc::Sender<StatusEvent>,
    ) -> Result<Self> {
        let recovered = spool::scan(&config.spool.dir)?;
        let state = if recovered.is_some() {
            SessionState::Recovering
        } else {
            SessionState::Idle
        };
        let verifier = DeliveryVerifier::new(config.delivery.fallback_dir.clone());

        Ok(Self {
            config,
            engine,
            capture_factory,
            channel,
            verifier,
            events,
            state,
            session_counter: 0,
            recovered,
            active: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// React to commands and component signals until `Exit` (or the command
    /// channel closing). Runs the whole session lifecycle.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<()> {
        if let Some(rec) = &self.recovered {
            self.emit(StatusEvent::RecoverableSessionFound {
                session: rec.manifest.session.clone(),
                duration_secs: rec.manifest.duration_secs(),
            });
        }

        loop {
            match self.next_tick(&mut commands).await {
                Tick::Command(None) => {
                    info!("command channel closed; shutting down");
                    self.finish_session().await?;
                    break;
                }
                Tick::Command(Some(cmd)) => {
                    if self.handle_command(cmd, &mut commands).await? {
                        break;
                    }
                }
                Tick::Segment(Some(segment)) => {
                    if let Some(a) = self.active.as_mut() {
                        a.dispatcher.push_segment(segment);
                    }
                }
                Tick::Segment(None) => {
                    if let Some(a) = self.active.as_mut() {
                        a.segments = None;
                    }
                }
                Tick::Notice(Some(CaptureNotice::DeviceLost)) => self.on_device_lost(),
                Tick::Notice(None) => {
                    if let Some(a) = self.active.as_mut() {
                        a.notices = None;
                    }
                }
                Tick::Outcome(Some(outcome)) => {
                    if let Some(a) = self.active.as_mut() {
                        a.aggregator.insert(outcome);
                    }
                }
                Tick::Outcome(None) => {
                    if let Some(a) = self.active.as_mut() {
                        a.outcomes = None;
                    }
                }
                Tick::SpoolDone(res) => {
                    let was_active = self.active.is_some();
                    self.on_spool_done(res).await?;
                    // A mid-session spool failure forces a finalize; stale
                    // commands queued during it must not restart anything.
                    if was_active && self.active.is_none() {
                        Self::discard_queued(&mut commands);
                    }
                }
            }
        }
        Ok(())
    }

    async fn next_tick(&mut self, commands: &mut mpsc::Receiver<Command>) -> Tick {
        let mut segments = None;
        let mut notices = None;
        let mut outcomes = None;
        let mut spool = None;
        if let Some(a) = self.active.as_mut() {
            segments = a.segments.as_mut();
            notices = a.notices.as_mut();
            outcomes = a.outcomes.as_mut();
            spool = a.spool_task.as_mut();
        }

        tokio::select! {
            cmd = commands.recv() => Tick::Command(cmd),
            seg = recv_opt(&mut segments) => Tick::Segment(seg),
            notice = recv_opt(&mut notices) => Tick::Notice(notice),
            outcome = recv_opt(&mut outcomes) => Tick::Outcome(outcome),
            res = join_opt(&mut spool) => Tick::SpoolDone(res),
        }
    }

    /// Validate a command against the current state. Invalid commands are
    /// rejected with a warning, never queued; rapid duplicates are no-ops.
    async fn handle_command(
        &mut self,
        cmd: Command,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Result<bool> {
        debug!(?cmd, state = %self.state, "command received");
        match (cmd, self.state) {
            (Command::StartOrToggle, SessionState::Idle) => {
                if let Err(e) = self.start_session(None).await {
                    error!("failed to start session: {e:#}");
                    self.state = SessionState::Idle;
                    self.active = None;
                }
            }
            (Command::StartOrToggle, SessionState::Recording | SessionState::Paused) => {
                self.finish_session().await?;
                // Finalizing can take a while; anything the user mashed in
                // the meantime targeted the old session, not a new one.
                Self::discard_queued(commands);
            }
            (Command::PauseResume, SessionState::Recording) => self.pause().await,
            (Command::PauseResume, SessionState::Paused) => self.resume().await,
            (Command::UnloadReload, _) => match self.engine.toggle_loaded().await {
                Ok(loaded) => info!(loaded, "transcription engine residency toggled"),
                Err(e) => warn!("engine toggle failed: {e}"),
            },
            (Command::RecoverResume, SessionState::Recovering) => {
                let rec = self.recovered.take();
                if let Err(e) = self.start_session(rec).await {
                    error!("failed to resume recovered session: {e:#}");
                    self.state = SessionState::Idle;
                    self.active = None;
                }
            }
            (Command::RecoverDiscard, SessionState::Recovering) => {
                if let Some(rec) = self.recovered.take() {
                    rec.discard()?;
                }
                self.state = SessionState::Idle;
            }
            (Command::Exit, _) => {
                self.finish_session().await?;
                info!("exit requested; controller stopping");
                return Ok(true);
            }
            (cmd, state) => {
                warn!(?cmd, %state, "command invalid in current state; ignored");
            }
        }
        Ok(false)
    }

    /// Spin up the full pipeline: capture task, VAD task, spooler task,
    /// dispatcher. With a recovered session, persisted frames replay
    /// through the gate first and the spooler adopts the existing manifest.
    async fn start_session(&mut self, recovered: Option<RecoveredSession>) -> Result<()> {
        self.session_counter += 1;
        let audio_cfg = &self.config.audio;

        let resuming = recovered.is_some();
        let (session_name, manifest, spool_dir, preroll, first_seq) = match recovered {
            Some(rec) => {
                let preroll = rec.frames()?;
                let first_seq = rec.next_seq();
                info!(
                    session = %rec.manifest.session,
                    frames = preroll.len(),
                    "resuming recovered session"
                );
                (
                    rec.manifest.session.clone(),
                    rec.manifest.clone(),
                    rec.dir.clone(),
                    preroll,
                    first_seq,
                )
            }
            None => {
                let id = SessionId::new(self.session_counter);
                let name = id.to_string();
                let manifest = SpoolManifest::new(
                    name.clone(),
                    audio_cfg.sample_rate,
                    audio_cfg.frame_duration_ms,
                );
                let dir = self.config.spool.dir.join(&name);
                (name, manifest, dir, Vec::new(), 0)
            }
        };

        // Subscribe both consumers before the producer starts so no frame
        // can be missed at startup.
        let (bus_tx, _) = broadcast::channel::<FrameEvent>(audio_cfg.bus_capacity);
        let vad_rx = bus_tx.subscribe();
        let spool_rx = bus_tx.subscribe();

        let mut backend = (self.capture_factory)()?;
        let samples_rx = backend.start().await?;

        let (ctl_tx, ctl_rx) = mpsc::channel(8);
        let (notice_tx, notice_rx) = mpsc::channel(8);
        let capture_task = FrameSource::spawn(
            bus_tx,
            samples_rx,
            audio_cfg.frame_samples(),
            audio_cfg.frame_duration_ms,
            first_seq,
            ctl_rx,
            notice_tx,
        );

        let gate = VadGate::new(
            Box::new(EnergyDetector::new(self.config.vad.aggressiveness)),
            GateConfig::from_millis(
                self.config.vad.trigger_on_ms,
                self.config.vad.trigger_off_ms,
                audio_cfg.frame_duration_ms,
            ),
        );
        let (seg_tx, seg_rx) = mpsc::channel(64);
        let vad_task = tokio::spawn(run_vad(vad_rx, preroll, gate, seg_tx));

        let spooler = if resuming {
            Spooler::resume(spool_dir, manifest, self.config.spool.chunk_secs)
        } else {
            Spooler::create(spool_dir, manifest, self.config.spool.chunk_secs)?
        };
        let spool_task = tokio::spawn(spooler.run(spool_rx));

        let (outcome_tx, outcome_rx) = mpsc::channel(16);
        let dispatcher = BatchDispatcher::new(
            DispatcherConfig {
                batch_length: Duration::from_secs(self.config.batch.length_secs),
                max_inflight: self.config.batch.max_inflight,
                retry_delay: self.config.batch.retry_delay(),
                sample_rate: audio_cfg.sample_rate,
            },
            Arc::clone(&self.engine),
            outcome_tx,
        );

        self.active = Some(ActiveSession {
            id: session_name.clone(),
            backend,
            ctl: ctl_tx,
            capture_task,
            notices: Some(notice_rx),
            segments: Some(seg_rx),
            vad_task,
            spool_task: Some(spool_task),
            dispatcher,
            outcomes: Some(outcome_rx),
            aggregator: ResultAggregator::new(),
            device_lost: false,
            spool_failed: false,
            spool_summary: None,
        });
        self.state = SessionState::Recording;
        self.emit(StatusEvent::RecordingStarted {
            session: session_name.clone(),
        });
        info!(session = %session_name, "recording started");
        Ok(())
    }

    async fn pause(&mut self) {
        let Some(a) = self.active.as_mut() else {
            return;
        };
        if a.ctl.send(CaptureCtl::Pause).await.is_err() {
            warn!("capture task gone; pause had no effect");
        }
        let session = a.id.clone();
        self.state = SessionState::Paused;
        info!(%session, "recording paused");
        self.emit(StatusEvent::RecordingPaused { session });
    }

    async fn resume(&mut self) {
        let Some(a) = self.active.as_mut() else {
            return;
        };
        let replacement = if a.device_lost {
            // The old device stream is gone; hand the capture task a new one.
            match (self.capture_factory)() {
                Ok(mut backend) => match backend.start().await {
                    Ok(rx) => {
                        a.backend = backend;
                        a.device_lost = false;
                        Some(rx)
                    }
                    Err(e) => {
                        warn!("input device still unavailable: {e:#}");
                        return;
                    }
                },
                Err(e) => {
                    warn!("input device still unavailable: {e:#}");
                    return;
                }
            }
        } else {
            None
        };

        if a.ctl.send(CaptureCtl::Resume(replacement)).await.is_err() {
            warn!("capture task gone; resume had no effect");
            return;
        }
        let session = a.id.clone();
        self.state = SessionState::Recording;
        info!(%session, "recording resumed");
        self.emit(StatusEvent::RecordingResumed { session });
    }

    fn on_device_lost(&mut self) {
        let Some(a) = self.active.as_mut() else {
            return;
        };
        a.device_lost = true;
        let session = a.id.clone();
        if self.state == SessionState::Recording {
            // Recoverable: pause instead of terminating the session.
            self.state = SessionState::Paused;
            warn!(%session, "input device lost; session paused");
            self.emit(StatusEvent::RecordingPaused { session });
        }
    }

    async fn on_spool_done(
        &mut self,
        res: Result<Result<SpoolSummary, SpoolError>, JoinError>,
    ) -> Result<()> {
        let mut failed = false;
        if let Some(a) = self.active.as_mut() {
            a.spool_task = None;
            match res {
                Ok(Ok(summary)) => a.spool_summary = Some(summary),
                Ok(Err(e)) => {
                    error!("spool write failure: {e}");
                    a.spool_failed = true;
                    failed = true;
                }
                Err(e) => {
                    error!("spooler task panicked: {e}");
                    a.spool_failed = true;
                    failed = true;
                }
            }
        }
        if failed && matches!(self.state, SessionState::Recording | SessionState::Paused) {
            // Durability can no longer be honored; stop now and salvage what
            // was already captured and transcribed.
            error!("persistence failure is fatal for the session; finalizing");
            self.finish_session().await?;
        }
        Ok(())
    }

    /// Stop → Finalizing → Completed. Closes the open segment and batch,
    /// drains in-flight batches (bounded), assembles, delivers, archives.
    async fn finish_session(&mut self) -> Result<()> {
        let Some(mut a) = self.active.take() else {
            return Ok(());
        };
        self.state = SessionState::Finalizing;
        info!(session = %a.id, "finalizing session");

        // Stop capture; the bus closes when the capture task exits, which
        // ends the VAD and spool tasks after they drain.
        let _ = a.ctl.send(CaptureCtl::Stop).await;
        if let Err(e) = (&mut a.capture_task).await {
            warn!("capture task ended abnormally: {e}");
        }
        if let Err(e) = a.backend.stop().await {
            warn!("capture backend stop failed: {e:#}");
        }

        // Drain every remaining segment into the dispatcher, then close the
        // final batch. No new frames are accepted from here on.
        if let Some(mut segments) = a.segments.take() {
            while let Some(segment) = segments.recv().await {
                a.dispatcher.push_segment(segment);
            }
        }
        if let Err(e) = (&mut a.vad_task).await {
            warn!("vad task ended abnormally: {e}");
        }
        let expected = a.dispatcher.finalize();

        if let Some(mut spool_task) = a.spool_task.take() {
            match (&mut spool_task).await {
                Ok(Ok(summary)) => a.spool_summary = Some(summary),
                Ok(Err(e)) => {
                    error!("spool failure during finalize: {e}");
                    a.spool_failed = true;
                }
                Err(e) => {
                    error!("spooler task panicked: {e}");
                    a.spool_failed = true;
                }
            }
        }

        // Already-submitted batches run to completion (their text is still
        // needed), bounded by the drain timeout.
        let deadline = tokio::time::Instant::now() + self.config.batch.drain_timeout();
        if let Some(outcomes) = a.outcomes.as_mut() {
            while !a.aggregator.is_complete(expected) {
                match tokio::time::timeout_at(deadline, outcomes.recv()).await {
                    Ok(Some(outcome)) => a.aggregator.insert(outcome),
                    Ok(None) => break,
                    Err(_) => {
                        warn!("drain timeout; unfinished batches become gaps");
                        break;
                    }
                }
            }
        }
        for batch_index in a.aggregator.missing(expected) {
            a.aggregator.insert(BatchOutcome {
                batch_index,
                result: BatchResult::Failed {
                    reason: "not completed before shutdown".into(),
                },
            });
        }
        a.dispatcher.abort_inflight();

        let transcript = a.aggregator.assemble(&a.id, expected);

        let mut receipt = None;
        if !transcript.text.is_empty() {
            let delivered = self
                .verifier
                .deliver(self.channel.as_mut(), &transcript.text)
                .await;
            match delivered {
                Ok(DeliveryReceipt::Primary) => receipt = Some(DeliveryReceipt::Primary),
                Ok(DeliveryReceipt::FallbackFile(path)) => {
                    self.emit(StatusEvent::DeliveryFellBackToFile { path: path.clone() });
                    receipt = Some(DeliveryReceipt::FallbackFile(path));
                }
                Err(e) => {
                    // The only unrecoverable delivery error. The text is
                    // preserved in the log as a last resort.
                    error!("delivery failed entirely: {e:#}");
                    error!(transcript = %transcript.text, "last-resort transcript dump");
                }
            }
        }

        if let Some(summary) = a.spool_summary.as_mut() {
            match archive::write_archive(&self.config.archive.dir, summary, &transcript.text) {
                Ok(_) => {
                    summary.manifest.completed = true;
                    if let Err(e) = summary.manifest.store(&summary.dir) {
                        warn!("failed to mark manifest completed: {e:#}");
                    } else if let Err(e) = std::fs::remove_dir_all(&summary.dir) {
                        warn!("failed to remove spool dir: {e}");
                    }
                }
                Err(e) => {
                    warn!("archive failed; spool retained for manual recovery: {e:#}");
                }
            }
        } else if a.spool_failed {
            warn!(session = %a.id, "spool incomplete; leftover chunks stay recoverable on disk");
        }

        self.state = SessionState::Completed;
        self.emit(StatusEvent::TranscriptionComplete {
            session: a.id.clone(),
            batches: expected,
            receipt,
        });
        info!(session = %a.id, batches = expected, "session complete");
        self.state = SessionState::Idle;
        Ok(())
    }

    fn emit(&self, event: StatusEvent) {
        // Notification delivery must never block the core.
        if let Err(e) = self.events.try_send(event) {
            warn!("status event dropped: {e}");
        }
    }

    /// Drop commands that queued up while a transition was in progress.
    /// They were aimed at the session that just ended.
    fn discard_queued(commands: &mut mpsc::Receiver<Command>) {
        while let Ok(cmd) = commands.try_recv() {
            warn!(?cmd, "command arrived while finalizing; ignored");
        }
    }
}

/// VAD worker: replays recovered frames first, then consumes the live bus.
async fn run_vad(
    mut rx: broadcast::Receiver<FrameEvent>,
    preroll: Vec<AudioFrame>,
    mut gate: VadGate,
    seg_tx: mpsc::Sender<SpeechSegment>,
) {
    if !preroll.is_empty() {
        debug!(frames = preroll.len(), "replaying recovered frames through vad gate");
        let mut prev_seq: Option<u64> = None;
        for frame in &preroll {
            // Recovered sessions can hold pause or lag gaps between chunks;
            // close the open segment at the boundary like the live path does.
            if prev_seq.is_some_and(|prev| frame.seq != prev + 1) {
                if let Some(segment) = gate.force_close() {
                    if seg_tx.send(segment).await.is_err() {
                        return;
                    }
                }
            }
            prev_seq = Some(frame.seq);
            if let Some(segment) = gate.push(frame) {
                if seg_tx.send(segment).await.is_err() {
                    return;
                }
            }
        }
    }

    loop {
        let emitted = match rx.recv().await {
            Ok(FrameEvent::Frame(frame)) => gate.push(&frame),
            Ok(FrameEvent::Gap { .. }) | Ok(FrameEvent::Flush) => gate.force_close(),
            Err(broadcast::error::RecvError::Lagged(skipped)) => gate.on_lag(skipped),
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if let Some(segment) = emitted {
            if seg_tx.send(segment).await.is_err() {
                return;
            }
        }
    }

    // Stream ended; nothing captured is discarded.
    if let Some(segment) = gate.force_close() {
        let _ = seg_tx.send(segment).await;
    }
}

async fn recv_opt<T>(rx: &mut Option<&mut mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_opt<T>(handle: &mut Option<&mut JoinHandle<T>>) -> Result<T, JoinError> {
    match handle {
        Some(handle) => (&mut **handle).await,
        None => std::future::pending().await,
    }
}
