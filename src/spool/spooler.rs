use std::fs;
use std::io::Write;
use std::path::PathBuf;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::audio::{AudioFrame, FrameEvent};

use super::manifest::{ChunkRecord, GapRecord, SpoolManifest};

/// Spool write failures are fatal for the session: once a chunk cannot be
/// persisted, the never-lose-a-word guarantee no longer holds.
#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("failed to write spool chunk: {0}")]
    Chunk(#[from] std::io::Error),
    #[error("failed to update spool manifest: {0}")]
    Manifest(#[source] anyhow::Error),
}

/// What the spooler leaves behind for archiving.
#[derive(Debug, Clone)]
pub struct SpoolSummary {
    pub dir: PathBuf,
    pub manifest: SpoolManifest,
}

/// Durable spooler: consumes the frame bus on its own task and persists
/// fixed-duration chunks of raw PCM, updating the manifest only after each
/// chunk file is confirmed on stable storage. At most one partial chunk of
/// audio can be lost on a crash.
pub struct Spooler {
    dir: PathBuf,
    manifest: SpoolManifest,
    chunk_target_samples: usize,
    next_index: u64,
    buf: Vec<i16>,
    first_seq: Option<u64>,
    last_seq: u64,
    /// Sequence number of the last frame appended, across chunks. Guards
    /// chunk records against silently absorbing a discontinuity.
    prev_seq: Option<u64>,
}

impl Spooler {
    /// Start a fresh session spool directory with an initial manifest.
    pub fn create(dir: PathBuf, manifest: SpoolManifest, chunk_secs: u64) -> Result<Self, SpoolError> {
        fs::create_dir_all(&dir)?;
        manifest.store(&dir).map_err(SpoolError::Manifest)?;
        info!(dir = %dir.display(), chunk_secs, "spooler initialized");
        Ok(Self {
            chunk_target_samples: (manifest.sample_rate as u64 * chunk_secs) as usize,
            next_index: 0,
            dir,
            manifest,
            buf: Vec::new(),
            first_seq: None,
            last_seq: 0,
            prev_seq: None,
        })
    }

    /// Adopt a recovered session's manifest and keep appending after its
    /// last confirmed chunk. Recovered frames are already on disk and do
    /// not pass through the spooler again.
    pub fn resume(dir: PathBuf, manifest: SpoolManifest, chunk_secs: u64) -> Self {
        let next_index = manifest.chunks.last().map(|c| c.index + 1).unwrap_or(0);
        info!(
            dir = %dir.display(),
            next_chunk = next_index,
            "spooler resuming recovered session"
        );
        Self {
            chunk_target_samples: (manifest.sample_rate as u64 * chunk_secs) as usize,
            next_index,
            prev_seq: manifest.last_acked_seq,
            dir,
            manifest,
            buf: Vec::new(),
            first_seq: None,
            last_seq: 0,
        }
    }

    /// Consume the bus until the producer closes it. Runs on its own task;
    /// lag only costs this consumer its oldest frames.
    pub async fn run(
        mut self,
        mut rx: broadcast::Receiver<FrameEvent>,
    ) -> Result<SpoolSummary, SpoolError> {
        loop {
            match rx.recv().await {
                Ok(FrameEvent::Frame(frame)) => self.append(&frame)?,
                Ok(FrameEvent::Gap { last_seq, next_seq }) => {
                    self.manifest.gaps.push(GapRecord {
                        after_seq: last_seq,
                        resume_seq: next_seq,
                    });
                    self.manifest.store(&self.dir).map_err(SpoolError::Manifest)?;
                    // The first frame after this marker is expected at
                    // next_seq; don't record the same hole twice.
                    self.prev_seq = Some(next_seq.saturating_sub(1));
                    debug!(after_seq = last_seq, resume_seq = next_seq, "gap recorded");
                }
                Ok(FrameEvent::Flush) => self.flush_partial()?,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Close the open chunk at the last frame we actually
                    // held; the next append records the hole once the
                    // resume sequence is known.
                    warn!(dropped = n, "spooler lagged; frames lost from spool stream");
                    self.flush_partial()?;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        self.flush_partial()?;
        info!(
            chunks = self.manifest.chunks.len(),
            "spooler finished ({:.1}s on disk)",
            self.manifest.duration_secs()
        );
        Ok(SpoolSummary {
            dir: self.dir,
            manifest: self.manifest,
        })
    }

    fn append(&mut self, frame: &AudioFrame) -> Result<(), SpoolError> {
        // A chunk record promises a contiguous first_seq..=last_seq range.
        // If frames went missing in transit, close the chunk at the last
        // frame we held and record the hole before continuing.
        if let Some(prev) = self.prev_seq {
            if frame.seq != prev + 1 {
                self.flush_partial()?;
                self.manifest.gaps.push(GapRecord {
                    after_seq: prev,
                    resume_seq: frame.seq,
                });
                self.manifest.store(&self.dir).map_err(SpoolError::Manifest)?;
                warn!(
                    after_seq = prev,
                    resume_seq = frame.seq,
                    "non-contiguous frame in spool stream; gap recorded"
                );
            }
        }
        self.prev_seq = Some(frame.seq);

        if self.first_seq.is_none() {
            self.first_seq = Some(frame.seq);
        }
        self.last_seq = frame.seq;
        self.buf.extend_from_slice(&frame.samples);

        if self.buf.len() >= self.chunk_target_samples {
            self.write_chunk()?;
        }
        Ok(())
    }

    /// Persist whatever is buffered, even a short chunk. Called on pause,
    /// stop, and stream end so pauses are durable boundaries too.
    fn flush_partial(&mut self) -> Result<(), SpoolError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.write_chunk()
    }

    fn write_chunk(&mut self) -> Result<(), SpoolError> {
        let file_name = SpoolManifest::chunk_file_name(self.next_index);
        let path = self.dir.join(&file_name);

        let mut bytes = Vec::with_capacity(self.buf.len() * 2);
        for &sample in &self.buf {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }

        let mut file = fs::File::create(&path)?;
        file.write_all(&bytes)?;
        // The manifest must only ever reference chunks that are really on
        // stable storage.
        file.sync_all()?;

        let record = ChunkRecord {
            index: self.next_index,
            file: file_name,
            first_seq: self.first_seq.take().unwrap_or(self.last_seq),
            last_seq: self.last_seq,
            samples: self.buf.len() as u64,
        };
        debug!(
            chunk = record.index,
            first_seq = record.first_seq,
            last_seq = record.last_seq,
            "spool chunk persisted"
        );

        self.manifest.chunks.push(record);
        self.manifest.last_acked_seq = Some(self.last_seq);
        self.manifest.store(&self.dir).map_err(SpoolError::Manifest)?;

        self.next_index += 1;
        self.buf.clear();
        Ok(())
    }
}
