use std::fmt::Display;

use serde::Serialize;

use crate::{inference::InferenceError, storage::entities::ActivityEntry};

use super::perception::StageExchange;

/// Every way a tracking run can fail after the gate let it through.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no display could be captured: {0}")]
    CaptureUnavailable(String),
    #[error("model {model} is unavailable: {reason}")]
    ModelUnavailable { model: String, reason: String },
    #[error("inference failed: {0}")]
    InferenceError(String),
    /// The classification produced an id outside of the run's taxonomy snapshot. Points at a
    /// broken prompt or output schema rather than a flaky model.
    #[error("model chose {activity_id:?} which is not one of {allowed:?}")]
    SchemaViolation {
        activity_id: String,
        allowed: Vec<String>,
    },
    /// The classified entry couldn't be appended. The entry is still handed back to the caller.
    #[error("failed to store activity: {error:#}")]
    StorageError {
        entry: Option<Box<ActivityEntry>>,
        error: anyhow::Error,
    },
}

impl From<InferenceError> for PipelineError {
    fn from(value: InferenceError) -> Self {
        match value {
            InferenceError::ModelUnavailable { model, reason } => {
                PipelineError::ModelUnavailable { model, reason }
            }
            other => PipelineError::InferenceError(other.to_string()),
        }
    }
}

impl PipelineError {
    /// Short stable name of the failure kind, used in logs and sampling output.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::CaptureUnavailable(_) => "CaptureUnavailable",
            PipelineError::ModelUnavailable { .. } => "ModelUnavailable",
            PipelineError::InferenceError(_) => "InferenceError",
            PipelineError::SchemaViolation { .. } => "SchemaViolation",
            PipelineError::StorageError { .. } => "StorageError",
        }
    }
}

/// Failure of a model stage. Once the model answered, its exchange is kept so that a failed run
/// can still be sampled.
#[derive(Debug)]
pub struct StageFailure {
    pub error: PipelineError,
    pub exchange: Option<StageExchange>,
}

impl StageFailure {
    pub fn answered(error: impl Into<PipelineError>, exchange: StageExchange) -> Self {
        Self {
            error: error.into(),
            exchange: Some(exchange),
        }
    }
}

impl From<PipelineError> for StageFailure {
    fn from(error: PipelineError) -> Self {
        Self {
            error,
            exchange: None,
        }
    }
}

impl From<InferenceError> for StageFailure {
    fn from(error: InferenceError) -> Self {
        PipelineError::from(error).into()
    }
}

/// State machine stage a run was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Gating,
    Capturing,
    Perceiving,
    Classifying,
    Recording,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Gating => "gating",
            Stage::Capturing => "capturing",
            Stage::Perceiving => "perceiving",
            Stage::Classifying => "classifying",
            Stage::Recording => "recording",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("run failed while {stage}: {error}")]
pub struct RunFailure {
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

impl RunFailure {
    pub fn new(stage: Stage, error: impl Into<PipelineError>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }

    /// Entry that was classified but not persisted, if the run got that far.
    pub fn unsaved_entry(&self) -> Option<&ActivityEntry> {
        match &self.error {
            PipelineError::StorageError { entry, .. } => entry.as_deref(),
            _ => None,
        }
    }
}
