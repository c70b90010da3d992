use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub spool: SpoolConfig,
    pub batch: BatchConfig,
    pub delivery: DeliveryConfig,
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    /// Capture sample rate in Hz.
    pub sample_rate: u32,
    /// Frame duration in ms; 10, 20 or 30.
    pub frame_duration_ms: u64,
    /// Per-consumer bus capacity in frames before a lagging consumer starts
    /// losing its oldest entries.
    pub bus_capacity: usize,
}

impl AudioConfig {
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as u64 * self.frame_duration_ms / 1000) as usize
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VadConfig {
    /// Detector aggressiveness, 0 (permissive) to 3 (strict).
    pub aggressiveness: u8,
    /// Consecutive speech needed to open a segment.
    pub trigger_on_ms: u64,
    /// Consecutive silence needed to close a segment.
    pub trigger_off_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpoolConfig {
    /// Root directory for per-session spool directories.
    pub dir: PathBuf,
    /// Audio per chunk file; bounds worst-case loss on crash.
    pub chunk_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Maximum audio per transcription batch.
    pub length_secs: u64,
    /// Concurrent in-flight submission cap.
    pub max_inflight: usize,
    /// Delay before the single retry of a failed submission.
    pub retry_delay_ms: u64,
    /// How long a stopping session waits for in-flight batches.
    pub drain_timeout_secs: u64,
}

impl BatchConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Where fallback transcript files land on verification failure.
    pub fallback_dir: PathBuf,
    /// Optional primary drop-file path; in-memory loopback when unset.
    pub drop_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Root directory for completed session archives.
    pub dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig {
                sample_rate: 16_000,
                frame_duration_ms: 30,
                bus_capacity: 256,
            },
            vad: VadConfig {
                aggressiveness: 2,
                trigger_on_ms: 90,
                trigger_off_ms: 700,
            },
            spool: SpoolConfig {
                dir: PathBuf::from("data/spool"),
                chunk_secs: 60,
            },
            batch: BatchConfig {
                length_secs: 600,
                max_inflight: 1,
                retry_delay_ms: 500,
                drain_timeout_secs: 30,
            },
            delivery: DeliveryConfig {
                fallback_dir: PathBuf::from("data/fallback"),
                drop_file: None,
            },
            archive: ArchiveConfig {
                dir: PathBuf::from("data/archive"),
            },
        }
    }
}

impl Config {
    /// Load defaults layered under an optional config file.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .set_default("audio.sample_rate", 16_000_i64)?
            .set_default("audio.frame_duration_ms", 30_i64)?
            .set_default("audio.bus_capacity", 256_i64)?
            .set_default("vad.aggressiveness", 2_i64)?
            .set_default("vad.trigger_on_ms", 90_i64)?
            .set_default("vad.trigger_off_ms", 700_i64)?
            .set_default("spool.dir", "data/spool")?
            .set_default("spool.chunk_secs", 60_i64)?
            .set_default("batch.length_secs", 600_i64)?
            .set_default("batch.max_inflight", 1_i64)?
            .set_default("batch.retry_delay_ms", 500_i64)?
            .set_default("batch.drain_timeout_secs", 30_i64)?
            .set_default("delivery.fallback_dir", "data/fallback")?
            .set_default("archive.dir", "data/archive")?
            .add_source(config::File::with_name(path).required(false))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
