use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{environment::CapturedFrame, storage::entities::ActivityEntry};

use super::{
    error::{RunFailure, Stage},
    perception::StageExchange,
};

/// Final state of a sampled run, written as `result.json`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SampleResult {
    Recorded {
        entry: ActivityEntry,
    },
    Failed {
        stage: Stage,
        kind: &'static str,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        entry: Option<ActivityEntry>,
    },
}

impl From<&RunFailure> for SampleResult {
    fn from(value: &RunFailure) -> Self {
        SampleResult::Failed {
            stage: value.stage,
            kind: value.error.kind(),
            message: value.error.to_string(),
            entry: value.unsaved_entry().cloned(),
        }
    }
}

/// Everything a run produced after capturing the screens.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub moment: DateTime<FixedOffset>,
    pub frames: Vec<CapturedFrame>,
    pub perception: Option<StageExchange>,
    pub classification: Option<StageExchange>,
    pub result: SampleResult,
}

/// Debugging side channel. Implementations swallow their own failures.
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn record(&self, artifacts: &RunArtifacts);
}

/// Writes one timestamp named directory per run.
pub struct DirectorySampleSink {
    dir: PathBuf,
}

async fn write_exchange(target: &Path, name: &str, exchange: &StageExchange) -> Result<()> {
    tokio::fs::write(target.join(format!("{name}_prompt.txt")), &exchange.prompt).await?;
    tokio::fs::write(
        target.join(format!("{name}_response.txt")),
        &exchange.raw_response,
    )
    .await?;
    if let Some(thinking) = &exchange.thinking {
        tokio::fs::write(target.join(format!("{name}_thinking.txt")), thinking).await?;
    }
    Ok(())
}

impl DirectorySampleSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn sample_dir_name(moment: DateTime<FixedOffset>) -> String {
        moment.format("%Y%m%d-%H%M%S%.3f").to_string()
    }

    async fn write(&self, artifacts: &RunArtifacts) -> Result<PathBuf> {
        let target = self.dir.join(Self::sample_dir_name(artifacts.moment));
        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("Failed to create {}", target.display()))?;

        for frame in &artifacts.frames {
            tokio::fs::write(
                target.join(format!("screen_{}.png", frame.screen_index)),
                &frame.image,
            )
            .await?;
        }
        if let Some(perception) = &artifacts.perception {
            write_exchange(&target, "perception", perception).await?;
        }
        if let Some(classification) = &artifacts.classification {
            write_exchange(&target, "classification", classification).await?;
        }
        tokio::fs::write(
            target.join("result.json"),
            serde_json::to_vec_pretty(&artifacts.result)?,
        )
        .await?;
        Ok(target)
    }
}

#[async_trait]
impl SampleSink for DirectorySampleSink {
    async fn record(&self, artifacts: &RunArtifacts) {
        match self.write(artifacts).await {
            Ok(v) => debug!("Sample written to {v:?}"),
            Err(e) => warn!("Failed to write sample {e:?}"),
        }
    }
}
