//! Model providers behind a single [InferenceClient] seam.
//!
//! Vision always runs on the local Ollama server. The text model used for classification runs on
//! either Ollama (`on-device`) or an OpenAI compatible endpoint (`remote-api`).

pub mod ollama;
pub mod openai;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::{ModelConfig, ModelProvider};

pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

/// One single-shot generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    /// PNG encoded images, in screen order.
    pub images: Vec<Vec<u8>>,
    /// JSON schema the output is constrained to. Ignored by clients that can't constrain output.
    pub format: Option<Value>,
    pub temperature: f32,
    /// Ask reasoning models to return their thinking separately from the answer.
    pub think: bool,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            images: vec![],
            format: None,
            temperature: 0.,
            think: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateResponse {
    pub model: String,
    pub response: String,
    pub thinking: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("model {model} is unavailable: {reason}")]
    ModelUnavailable { model: String, reason: String },
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Request(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl InferenceError {
    fn from_reqwest(model: &str, timeout: Duration, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            InferenceError::Timeout(timeout)
        } else if error.is_connect() {
            InferenceError::ModelUnavailable {
                model: model.to_string(),
                reason: format!("cannot connect to the provider: {error}"),
            }
        } else if error.is_decode() {
            InferenceError::MalformedResponse(error.to_string())
        } else {
            InferenceError::Request(error.to_string())
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InferenceClient: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Whether [GenerateRequest::format] is enforced at generation time.
    fn supports_structured_output(&self) -> bool;

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, InferenceError>;
}

/// Client used by the perception stage.
pub fn create_vision_client(config: &ModelConfig) -> Result<Arc<dyn InferenceClient>> {
    Ok(Arc::new(OllamaClient::new(
        &config.ollama_url,
        Duration::from_secs(config.request_timeout_secs),
    )?))
}

/// Client used by the classification stage, chosen by the configured provider.
pub fn create_text_client(config: &ModelConfig) -> Result<Arc<dyn InferenceClient>> {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    Ok(match config.provider {
        ModelProvider::OnDevice => Arc::new(OllamaClient::new(&config.ollama_url, timeout)?),
        ModelProvider::RemoteApi => Arc::new(OpenAiClient::new(
            &config.remote_url,
            std::env::var(&config.remote_api_key_env).ok(),
            config.remote_structured_output,
            timeout,
        )?),
    })
}
