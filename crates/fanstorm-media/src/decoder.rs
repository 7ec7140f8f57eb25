//! Playback observation through an external decoder

use crate::error::{MediaError, MediaResult};
use crate::process::find_binary;
use crate::progress::progress_samples;
use async_trait::async_trait;
use fanstorm_core::ProgressSample;
use futures::StreamExt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Producer side of the result aggregator queue
pub type SampleSender = mpsc::UnboundedSender<ProgressSample>;

/// Watches a stream as one viewer and reports progress samples
#[async_trait]
pub trait PlaybackObserver: Send + Sync {
    /// Runs until playback ends, fails, or `cancel` fires
    async fn observe(
        &self,
        subject: String,
        edge_url: String,
        started: Instant,
        samples: SampleSender,
        cancel: CancellationToken,
    ) -> MediaResult<()>;
}

/// Forward progress parsed from `reader` into `samples`.
///
/// Returns `true` if it stopped because `cancel` fired, `false` when the
/// reader ended or the aggregator went away.
pub async fn pump_progress<R>(
    reader: R,
    subject: String,
    started: Instant,
    samples: &SampleSender,
    cancel: &CancellationToken,
) -> bool
where
    R: AsyncRead + Unpin,
{
    let stream = progress_samples(reader, subject, started);
    tokio::pin!(stream);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return true,
            next = stream.next() => match next {
                Some(sample) => {
                    if samples.send(sample).is_err() {
                        return false;
                    }
                }
                None => return false,
            },
        }
    }
}

/// `rtmpdump --realtime` viewer
#[derive(Clone, Debug)]
pub struct RtmpdumpObserver {
    binary: PathBuf,
}

impl RtmpdumpObserver {
    /// Resolve the decoder binary up front so a missing install fails the run early
    pub fn new(binary: &str) -> MediaResult<Self> {
        Ok(Self {
            binary: find_binary(binary)?,
        })
    }

    fn binary_name(&self) -> String {
        self.binary.display().to_string()
    }
}

#[async_trait]
impl PlaybackObserver for RtmpdumpObserver {
    async fn observe(
        &self,
        subject: String,
        edge_url: String,
        started: Instant,
        samples: SampleSender,
        cancel: CancellationToken,
    ) -> MediaResult<()> {
        info!("Connecting {} to {}", subject, edge_url);

        let mut child = Command::new(&self.binary)
            .args(["--realtime", "-r", edge_url.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MediaError::Spawn {
                binary: self.binary_name(),
                source,
            })?;

        let stderr = child.stderr.take().ok_or_else(|| {
            MediaError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "decoder stderr not captured",
            ))
        })?;

        if pump_progress(stderr, subject.clone(), started, &samples, &cancel).await {
            debug!("Stopping playback for {}", subject);
            if let Err(e) = child.kill().await {
                warn!("Failed to stop decoder for {}: {}", subject, e);
            }
            return Ok(());
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(MediaError::Exited {
                binary: self.binary_name(),
                status: status.to_string(),
            });
        }
        info!("Playback ended for {}", subject);
        Ok(())
    }
}
