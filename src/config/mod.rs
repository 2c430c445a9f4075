//! Tracker configuration read from `<app_dir>/config.json`.
//!
//! Configuration problems never stop tracking. A missing file silently means defaults, a broken
//! one is reported as [ConfigError] and replaced by defaults as a whole.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{pipeline::gate::WorkSchedule, utils::time::hh_mm};

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const TAXONOMY_FILE_NAME: &str = "activity_types.json";
pub const IDLE_THRESHOLD_ENV: &str = "IDLE_THRESHOLD_SECONDS";

/// Configuration could not be used. Always absorbed by falling back to defaults.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("work hours start {} must be before their end {}", .start.format("%H:%M"), .end.format("%H:%M"))]
    EmptyWorkHours { start: NaiveTime, end: NaiveTime },
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },
    #[error("{} must be a positive whole number of seconds, got {0:?}", IDLE_THRESHOLD_ENV)]
    InvalidIdleOverride(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkHours {
    #[serde(with = "hh_mm")]
    pub start: NaiveTime,
    #[serde(with = "hh_mm")]
    pub end: NaiveTime,
}

impl Default for WorkHours {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            end: NaiveTime::from_hms_opt(17, 30, 0).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelProvider {
    /// Local Ollama server.
    OnDevice,
    /// OpenAI compatible chat completions endpoint.
    RemoteApi,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub vision: String,
    pub text: String,
    pub provider: ModelProvider,
    pub ollama_url: String,
    pub remote_url: String,
    pub remote_api_key_env: String,
    pub remote_structured_output: bool,
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vision: "qwen3-vl:4b".into(),
            text: "qwen3:8b".into(),
            provider: ModelProvider::OnDevice,
            ollama_url: "http://localhost:11434".into(),
            remote_url: "https://api.openai.com/v1".into(),
            remote_api_key_env: "OPENAI_API_KEY".into(),
            remote_structured_output: true,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub work_hours: WorkHours,
    pub work_days: Vec<Weekday>,
    pub idle_threshold_secs: u64,
    pub interval_secs: u64,
    pub models: ModelConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_marker: Option<PathBuf>,
    pub sampling: SamplingConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            work_hours: WorkHours::default(),
            work_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            idle_threshold_secs: 300,
            interval_secs: 60,
            models: ModelConfig::default(),
            pause_marker: None,
            sampling: SamplingConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Reads the configuration at `path`. Never fails: problems are logged and defaults are used
    /// instead. The idle threshold environment override is applied last.
    pub fn load(path: &Path) -> Self {
        let config = match Self::try_load(path) {
            Ok(Some(config)) => config,
            Ok(None) => {
                debug!("No configuration at {path:?}, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!("Configuration is invalid, using defaults: {e}");
                Self::default()
            }
        };
        config.with_idle_override(std::env::var(IDLE_THRESHOLD_ENV).ok().as_deref())
    }

    /// Strict variant of [Self::load]. [None] when the file doesn't exist.
    pub fn try_load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    source,
                })
            }
        };
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.work_hours.start >= self.work_hours.end {
            return Err(ConfigError::EmptyWorkHours {
                start: self.work_hours.start,
                end: self.work_hours.end,
            });
        }
        if self.interval_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                name: "interval_secs",
            });
        }
        if self.idle_threshold_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                name: "idle_threshold_secs",
            });
        }
        if self.models.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                name: "models.request_timeout_secs",
            });
        }
        Ok(())
    }

    /// Applies an `IDLE_THRESHOLD_SECONDS` value. Unparseable or zero values are reported and
    /// ignored.
    pub fn with_idle_override(mut self, value: Option<&str>) -> Self {
        let Some(value) = value else {
            return self;
        };
        match value.trim().parse::<u64>() {
            Ok(seconds) if seconds > 0 => {
                debug!("Idle threshold overridden to {seconds}s");
                self.idle_threshold_secs = seconds;
            }
            _ => warn!("{}", ConfigError::InvalidIdleOverride(value.to_string())),
        }
        self
    }

    pub fn write_default(path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(&Self::default())?)?;
        Ok(())
    }

    pub fn work_schedule(&self) -> WorkSchedule {
        WorkSchedule::new(
            self.work_hours.start,
            self.work_hours.end,
            self.work_days.iter().copied(),
        )
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn pause_marker_path(&self, application_path: &Path) -> PathBuf {
        self.pause_marker
            .clone()
            .unwrap_or_else(|| application_path.join("paused"))
    }

    pub fn sampling_dir(&self, application_path: &Path) -> PathBuf {
        self.sampling
            .dir
            .clone()
            .unwrap_or_else(|| application_path.join("samples"))
    }
}
