use anyhow::Result;
use tokio::sync::mpsc;

/// Raw audio capture backend.
///
/// Backends deliver sample blocks of whatever size the device hands out;
/// the frame source reframes them into fixed-duration frames. When the
/// device disappears mid-stream the backend closes its channel, which the
/// frame source reports as a recoverable device loss.
#[async_trait::async_trait]
pub trait CaptureBackend: Send {
    /// Start capturing. Returns a receiver of raw sample blocks (i16 PCM,
    /// mono, 16 kHz).
    async fn start(&mut self) -> Result<mpsc::Receiver<Vec<i16>>>;

    /// Stop capturing and release the device.
    async fn stop(&mut self) -> Result<()>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

/// Capture source selection.
pub enum CaptureSource {
    /// Default input device (requires the `mic` feature).
    Microphone,
    /// Pre-scripted sample blocks, delivered once then closed. Used by
    /// tests and batch processing.
    Scripted(Vec<Vec<i16>>),
}

pub struct CaptureBackendFactory;

impl CaptureBackendFactory {
    pub fn create(source: CaptureSource) -> Result<Box<dyn CaptureBackend>> {
        match source {
            CaptureSource::Microphone => {
                #[cfg(feature = "mic")]
                {
                    Ok(Box::new(super::mic::MicBackend::new()?))
                }
                #[cfg(not(feature = "mic"))]
                {
                    anyhow::bail!("microphone capture requires building with the `mic` feature")
                }
            }
            CaptureSource::Scripted(blocks) => Ok(Box::new(ScriptedBackend::new(blocks))),
        }
    }
}

/// Backend that plays out a fixed script of sample blocks and then closes
/// the channel, which downstream treats as end of device input.
pub struct ScriptedBackend {
    blocks: Option<Vec<Vec<i16>>>,
}

impl ScriptedBackend {
    pub fn new(blocks: Vec<Vec<i16>>) -> Self {
        Self {
            blocks: Some(blocks),
        }
    }
}

#[async_trait::async_trait]
impl CaptureBackend for ScriptedBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<Vec<i16>>> {
        let blocks = self
            .blocks
            .take()
            .ok_or_else(|| anyhow::anyhow!("scripted backend already started"))?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            for block in blocks {
                if tx.send(block).await.is_err() {
                    break;
                }
            }
            // Sender drops here; the frame source sees the stream end.
        });

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
