//! Delivery with verified integrity: write the final text to a primary
//! channel, read it back, compare checksums, and fall back to a durable
//! file on any mismatch. The caller is always told either "delivered via
//! primary channel" or "delivered via fallback file" — never "lost".

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A writable text channel that can be read back for verification. The OS
/// clipboard binding lives in the shell collaborator; the core ships file
/// and in-memory channels.
pub trait DeliveryChannel: Send {
    fn name(&self) -> &str;
    fn write(&mut self, text: &str) -> Result<()>;
    fn read_back(&mut self) -> Result<String>;
}

/// Drops the text at a fixed path, e.g. for a paste watcher to pick up.
pub struct DropFileChannel {
    path: PathBuf,
}

impl DropFileChannel {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl DeliveryChannel for DropFileChannel {
    fn name(&self) -> &str {
        "drop-file"
    }

    fn write(&mut self, text: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    fn read_back(&mut self) -> Result<String> {
        fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read back {}", self.path.display()))
    }
}

/// In-memory loopback channel. Tests use `poison` to force a read-back
/// mismatch and exercise the fallback path.
#[derive(Default)]
pub struct MemoryChannel {
    contents: Option<String>,
    pub poison: Option<String>,
}

impl DeliveryChannel for MemoryChannel {
    fn name(&self) -> &str {
        "memory"
    }

    fn write(&mut self, text: &str) -> Result<()> {
        self.contents = Some(text.to_string());
        Ok(())
    }

    fn read_back(&mut self) -> Result<String> {
        if let Some(poison) = &self.poison {
            return Ok(poison.clone());
        }
        self.contents
            .clone()
            .ok_or_else(|| anyhow::anyhow!("channel is empty"))
    }
}

/// How the text reached the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReceipt {
    Primary,
    FallbackFile(PathBuf),
}

/// Two-phase-commit delivery: write, verify by checksum, fall back.
pub struct DeliveryVerifier {
    fallback_dir: PathBuf,
    max_attempts: u32,
    retry_delay: Duration,
}

impl DeliveryVerifier {
    pub fn new(fallback_dir: PathBuf) -> Self {
        Self {
            fallback_dir,
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }

    pub fn with_retries(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Deliver `text` through `channel`, verifying the read-back checksum
    /// (not just length). On persistent mismatch, write the complete text to
    /// a fallback file and report its path. A fallback-write failure is the
    /// only error this returns; the caller still holds the text.
    pub async fn deliver(
        &self,
        channel: &mut dyn DeliveryChannel,
        text: &str,
    ) -> Result<DeliveryReceipt> {
        let want = checksum(text);

        for attempt in 1..=self.max_attempts {
            match try_once(channel, text, &want) {
                Ok(()) => {
                    info!(channel = channel.name(), attempt, "delivery verified");
                    return Ok(DeliveryReceipt::Primary);
                }
                Err(e) => {
                    debug!(
                        channel = channel.name(),
                        attempt, "delivery attempt failed: {e:#}"
                    );
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        warn!(
            channel = channel.name(),
            "primary delivery failed verification; falling back to file"
        );
        let path = self.write_fallback(text)?;
        info!(path = %path.display(), "transcript written to fallback file");
        Ok(DeliveryReceipt::FallbackFile(path))
    }

    fn write_fallback(&self, text: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.fallback_dir).with_context(|| {
            format!(
                "failed to create fallback dir {}",
                self.fallback_dir.display()
            )
        })?;

        let slug = slugify(text);
        let mut path = self.fallback_dir.join(format!("{slug}.txt"));
        let mut counter = 1;
        while path.exists() {
            path = self.fallback_dir.join(format!("{slug}_{counter}.txt"));
            counter += 1;
        }

        fs::write(&path, text)
            .with_context(|| format!("failed to write fallback file {}", path.display()))?;
        Ok(path)
    }
}

fn try_once(channel: &mut dyn DeliveryChannel, text: &str, want: &[u8]) -> Result<()> {
    channel.write(text)?;
    let echoed = channel.read_back()?;
    if checksum(&echoed) == want {
        Ok(())
    } else {
        anyhow::bail!("read-back checksum mismatch")
    }
}

fn checksum(text: &str) -> Vec<u8> {
    Sha256::digest(text.as_bytes()).to_vec()
}

/// Derive a safe fallback file name from the first words of the text.
fn slugify(text: &str) -> String {
    let slug: String = text
        .split_whitespace()
        .take(7)
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(64)
        .collect();
    if slug.is_empty() {
        "transcript".to_string()
    } else {
        slug
    }
}
