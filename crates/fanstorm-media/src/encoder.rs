//! Broadcast ingest through an external encoder

use crate::error::{MediaError, MediaResult};
use crate::process::find_binary;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Feeds the broadcast under test
#[async_trait]
pub trait StreamIngest: Send + Sync {
    /// Push to `origin_url` until the source ends or `cancel` fires
    async fn push(&self, origin_url: &str, cancel: CancellationToken) -> MediaResult<()>;
}

/// Pushes a local video file to the broadcast origin with `ffmpeg -re`
#[derive(Clone, Debug)]
pub struct EncoderPush {
    binary: PathBuf,
    video_path: PathBuf,
}

impl EncoderPush {
    /// Fails when the encoder binary or the video file is missing
    pub fn new(binary: &str, video_path: &Path) -> MediaResult<Self> {
        let binary = find_binary(binary)?;
        if !video_path.is_file() {
            return Err(MediaError::MissingInput(video_path.to_path_buf()));
        }
        Ok(Self {
            binary,
            video_path: video_path.to_path_buf(),
        })
    }

    fn args(&self, origin_url: &str) -> Vec<String> {
        vec![
            "-re".to_string(),
            "-i".to_string(),
            self.video_path.display().to_string(),
            "-f".to_string(),
            "flv".to_string(),
            origin_url.to_string(),
        ]
    }
}

#[async_trait]
impl StreamIngest for EncoderPush {
    async fn push(&self, origin_url: &str, cancel: CancellationToken) -> MediaResult<()> {
        info!("Pushing {:?} to {}", self.video_path, origin_url);

        let mut child = Command::new(&self.binary)
            .args(self.args(origin_url))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MediaError::Spawn {
                binary: self.binary.display().to_string(),
                source,
            })?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to stop encoder: {}", e);
                }
                Ok(())
            }
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    info!("Encoder finished pushing {:?}", self.video_path);
                    Ok(())
                } else {
                    Err(MediaError::Exited {
                        binary: self.binary.display().to_string(),
                        status: status.to_string(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_encoder_args() {
        let video = tempfile::NamedTempFile::new().unwrap();

        let push = EncoderPush::new("sh", video.path()).unwrap();
        assert_eq!(
            push.args("rtmp://10.0.0.5:1935/live/hrant"),
            vec![
                "-re".to_string(),
                "-i".to_string(),
                video.path().display().to_string(),
                "-f".to_string(),
                "flv".to_string(),
                "rtmp://10.0.0.5:1935/live/hrant".to_string(),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_video_is_fatal() {
        let err = EncoderPush::new("sh", Path::new("/nonexistent/640.flv")).unwrap_err();
        assert!(matches!(err, MediaError::MissingInput(_)));
    }

    #[test]
    fn test_missing_encoder_is_fatal() {
        let err = EncoderPush::new("no-such-ffmpeg-build", Path::new("640.flv")).unwrap_err();
        assert!(matches!(err, MediaError::BinaryNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let video = tempfile::NamedTempFile::new().unwrap();
        let push = EncoderPush::new("sh", video.path()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(push.push("rtmp://x", cancel).await.is_ok());
    }
}
