//! Device-side collaborators: audio clips and capture through ALSA command
//! line tools, plus the restart routine. Everything here is the narrow,
//! possibly-slow, possibly-failing surface the core orchestrates against.

use async_trait::async_trait;
use echomate_core::traits::DeviceCollaborator;
use echomate_core::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

const SAMPLE_RATE: u32 = 16_000;

pub struct DeviceHooks {
    clips_dir: PathBuf,
    capture_path: PathBuf,
}

impl DeviceHooks {
    pub fn new(clips_dir: impl Into<PathBuf>) -> Self {
        Self {
            clips_dir: clips_dir.into(),
            capture_path: std::env::temp_dir().join("echomate-capture.raw"),
        }
    }

    async fn run_arecord(&self, duration_secs: u32) -> Result<usize> {
        let status = Command::new("arecord")
            .arg("-q")
            .arg("-t").arg("raw")
            .arg("-f").arg("S16_LE")
            .arg("-r").arg(SAMPLE_RATE.to_string())
            .arg("-c").arg("1")
            .arg("-d").arg(duration_secs.to_string())
            .arg(&self.capture_path)
            .status()
            .await
            .map_err(|e| Error::CommandFailed(format!("arecord spawn failed: {e}")))?;
        if !status.success() {
            return Err(Error::ResourceExhausted(format!(
                "arecord exited with {status}"
            )));
        }
        let meta = tokio::fs::metadata(&self.capture_path).await?;
        Ok(meta.len() as usize)
    }
}

#[async_trait]
impl DeviceCollaborator for DeviceHooks {
    async fn play_clip(&self, id: u32) -> Result<()> {
        let path = self.clips_dir.join(format!("{id}.pcm"));
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(Error::Validation(format!("no such clip: {id}")));
        }
        info!(id, path = %path.display(), "playing clip");
        let status = Command::new("aplay")
            .arg("-q")
            .arg("-t").arg("raw")
            .arg("-f").arg("S16_LE")
            .arg("-r").arg(SAMPLE_RATE.to_string())
            .arg("-c").arg("1")
            .arg(&path)
            .status()
            .await
            .map_err(|e| Error::CommandFailed(format!("aplay spawn failed: {e}")))?;
        if !status.success() {
            return Err(Error::CommandFailed(format!("aplay exited with {status}")));
        }
        Ok(())
    }

    async fn record(&self, duration_secs: u32) -> Result<usize> {
        info!(duration_secs, "starting capture");
        match self.run_arecord(duration_secs).await {
            Ok(size) => Ok(size),
            // degrade once with a smaller capture before giving up
            Err(Error::ResourceExhausted(reason)) if duration_secs > 1 => {
                warn!(%reason, "capture failed, retrying at half duration");
                self.run_arecord(duration_secs / 2).await
            }
            Err(e) => Err(e),
        }
    }

    async fn restart_device(&self) {
        warn!("restarting device");
        tokio::time::sleep(Duration::from_secs(1)).await;
        // fail-stop: the service manager brings us back up
        std::process::exit(0);
    }

    async fn factory_reset(&self) {
        let _ = tokio::fs::remove_file(&self.capture_path).await;
        info!("device state cleared");
    }
}
