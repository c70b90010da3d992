use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One persisted chunk file: a fixed window of raw PCM frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Chunk number (0-indexed), matching the zero-padded file name.
    pub index: u64,
    /// File name relative to the session spool directory.
    pub file: String,
    /// First frame sequence number in this chunk.
    pub first_seq: u64,
    /// Last frame sequence number in this chunk.
    pub last_seq: u64,
    /// Total samples in this chunk.
    pub samples: u64,
}

/// A pause interval in the frame stream, recorded rather than silently
/// skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapRecord {
    /// Last frame published before the pause.
    pub after_seq: u64,
    /// First frame published after resuming.
    pub resume_seq: u64,
}

/// Durable per-session record of everything the spooler has confirmed on
/// stable storage. Single writer (the spooler); read once at startup by the
/// session controller for crash recovery; deleted only after the session
/// completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolManifest {
    pub session: String,
    pub started_at: DateTime<Utc>,
    pub sample_rate: u32,
    pub frame_duration_ms: u64,
    pub chunks: Vec<ChunkRecord>,
    pub gaps: Vec<GapRecord>,
    /// Highest frame sequence number confirmed on disk.
    pub last_acked_seq: Option<u64>,
    /// Set just before the session archive is finalized; a manifest found
    /// at startup without this flag marks a recoverable session.
    pub completed: bool,
}

impl SpoolManifest {
    pub const FILE_NAME: &'static str = "manifest.json";

    pub fn new(session: String, sample_rate: u32, frame_duration_ms: u64) -> Self {
        Self {
            session,
            started_at: Utc::now(),
            sample_rate,
            frame_duration_ms,
            chunks: Vec::new(),
            gaps: Vec::new(),
            last_acked_seq: None,
            completed: false,
        }
    }

    /// Zero-padded so chunk files sort lexicographically in recording order.
    pub fn chunk_file_name(index: u64) -> String {
        format!("chunk-{index:06}.pcm")
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(Self::FILE_NAME);
        let data = fs::read(&path)
            .with_context(|| format!("failed to read spool manifest {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse spool manifest {}", path.display()))
    }

    /// Persist atomically: write a temp file, fsync, rename over the old
    /// manifest. A crash mid-update leaves the previous manifest intact.
    pub fn store(&self, dir: &Path) -> Result<()> {
        let path = dir.join(Self::FILE_NAME);
        let tmp = dir.join(format!("{}.tmp", Self::FILE_NAME));

        let data = serde_json::to_vec_pretty(self).context("failed to encode spool manifest")?;
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            use std::io::Write;
            file.write_all(&data)
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to sync {}", tmp.display()))?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Total spooled audio duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        let samples: u64 = self.chunks.iter().map(|c| c.samples).sum();
        samples as f64 / self.sample_rate as f64
    }
}
