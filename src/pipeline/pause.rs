use std::{io::ErrorKind, path::PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

/// Manual pause switch, read once per run. The pipeline never changes it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PauseSignal: Send + Sync {
    async fn is_paused(&self) -> bool;
}

/// Pause state kept as the presence of a marker file, so any process can flip it.
pub struct PauseMarker {
    path: PathBuf,
}

impl PauseMarker {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Returns false when tracking was already paused.
    pub async fn pause(&self) -> Result<bool> {
        if self.is_paused().await {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, chrono::Local::now().to_rfc3339()).await?;
        info!("Tracking paused");
        Ok(true)
    }

    /// Returns false when tracking wasn't paused.
    pub async fn resume(&self) -> Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Tracking resumed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl PauseSignal for PauseMarker {
    async fn is_paused(&self) -> bool {
        match tokio::fs::try_exists(&self.path).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to check the pause marker {:?} {e:?}", self.path);
                false
            }
        }
    }
}
