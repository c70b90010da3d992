//! Session archive output: the original full-length audio plus the final
//! transcript text, laid out for an external archiving collaborator.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::spool::SpoolSummary;

#[derive(Debug, Clone)]
pub struct ArchivePaths {
    pub audio: PathBuf,
    pub transcript: PathBuf,
}

/// Merge the session's spool chunks into one WAV file and write the final
/// transcript next to it, keyed by session id. The spool directory is left
/// untouched; the controller deletes it only after this succeeds.
pub fn write_archive(
    archive_root: &Path,
    summary: &SpoolSummary,
    transcript_text: &str,
) -> Result<ArchivePaths> {
    let dir = archive_root.join(&summary.manifest.session);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create archive dir {}", dir.display()))?;

    let audio = dir.join("recording.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: summary.manifest.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&audio, spec)
        .with_context(|| format!("failed to create archive WAV {}", audio.display()))?;

    for chunk in &summary.manifest.chunks {
        let path = summary.dir.join(&chunk.file);
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read spool chunk {}", path.display()))?;
        for pair in bytes.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            writer
                .write_sample(sample)
                .context("failed to write archive sample")?;
        }
    }
    writer.finalize().context("failed to finalize archive WAV")?;

    let transcript = dir.join("transcript.txt");
    fs::write(&transcript, transcript_text)
        .with_context(|| format!("failed to write transcript {}", transcript.display()))?;

    info!(
        session = %summary.manifest.session,
        audio = %audio.display(),
        "session archived ({:.1}s)",
        summary.manifest.duration_secs()
    );

    Ok(ArchivePaths { audio, transcript })
}
