use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::audio::AudioFrame;

use super::manifest::SpoolManifest;

/// An unterminated session found on disk at startup.
#[derive(Debug)]
pub struct RecoveredSession {
    pub dir: PathBuf,
    pub manifest: SpoolManifest,
}

/// Scan the spool root for the oldest session whose manifest was never
/// marked completed. Directory names embed the session counter so plain
/// lexicographic order is chronological.
pub fn scan(spool_root: &Path) -> Result<Option<RecoveredSession>> {
    if !spool_root.exists() {
        return Ok(None);
    }

    let mut dirs: Vec<PathBuf> = fs::read_dir(spool_root)
        .with_context(|| format!("failed to read spool root {}", spool_root.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    for dir in dirs {
        if !dir.join(SpoolManifest::FILE_NAME).exists() {
            continue;
        }
        match SpoolManifest::load(&dir) {
            Ok(manifest) if !manifest.completed => {
                info!(
                    session = %manifest.session,
                    chunks = manifest.chunks.len(),
                    "found recoverable session ({:.1}s spooled)",
                    manifest.duration_secs()
                );
                return Ok(Some(RecoveredSession { dir, manifest }));
            }
            Ok(_) => {
                // Completed but not cleaned up; stale, leave it alone.
            }
            Err(e) => {
                warn!(dir = %dir.display(), "unreadable spool manifest, skipping: {e:#}");
            }
        }
    }
    Ok(None)
}

impl RecoveredSession {
    /// Reconstruct the persisted frame stream, in order, from the chunk
    /// files the manifest acknowledges. Frames are rebuilt with their
    /// original sequence numbers so replay is indistinguishable from live
    /// capture downstream.
    pub fn frames(&self) -> Result<Vec<AudioFrame>> {
        let frame_samples = (self.manifest.sample_rate as u64 * self.manifest.frame_duration_ms
            / 1000) as usize;
        let mut frames = Vec::new();

        for chunk in &self.manifest.chunks {
            let path = self.dir.join(&chunk.file);
            let bytes = fs::read(&path)
                .with_context(|| format!("failed to read spool chunk {}", path.display()))?;

            let samples: Vec<i16> = bytes
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                .collect();

            let mut seq = chunk.first_seq;
            for window in samples.chunks_exact(frame_samples) {
                frames.push(AudioFrame {
                    seq,
                    timestamp_ms: seq * self.manifest.frame_duration_ms,
                    samples: window.to_vec(),
                });
                seq += 1;
            }
        }
        Ok(frames)
    }

    /// First sequence number for live capture after replay.
    pub fn next_seq(&self) -> u64 {
        self.manifest.last_acked_seq.map(|s| s + 1).unwrap_or(0)
    }

    /// Delete the manifest and all chunk files. Nothing is left behind.
    pub fn discard(self) -> Result<()> {
        info!(dir = %self.dir.display(), "discarding recovered session");
        fs::remove_dir_all(&self.dir)
            .with_context(|| format!("failed to remove spool dir {}", self.dir.display()))
    }
}
