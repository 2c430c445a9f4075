use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use super::{GenerateRequest, GenerateResponse, InferenceClient, InferenceError};

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a Value>,
    // Models without thinking support reject the flag entirely, so it's only sent when set.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    think: bool,
    options: OllamaOptions,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    model: String,
    response: String,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaErrorResponse {
    error: String,
}

/// Client of a local Ollama server using the non-streaming `/api/generate` endpoint.
pub struct OllamaClient {
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }

    fn error_from_status(model: &str, status: StatusCode, body: &str) -> InferenceError {
        let message = serde_json::from_str::<OllamaErrorResponse>(body)
            .map(|v| v.error)
            .unwrap_or_else(|_| body.to_string());
        if status == StatusCode::NOT_FOUND || message.contains("not found") {
            InferenceError::ModelUnavailable {
                model: model.to_string(),
                reason: message,
            }
        } else {
            InferenceError::Request(format!("Ollama returned {status}: {message}"))
        }
    }
}

#[async_trait]
impl InferenceClient for OllamaClient {
    fn provider_name(&self) -> &'static str {
        "ollama"
    }

    fn supports_structured_output(&self) -> bool {
        true
    }

    #[instrument(skip_all, fields(model = %request.model, images = request.images.len()))]
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, InferenceError> {
        let body = OllamaGenerateRequest {
            model: &request.model,
            prompt: &request.prompt,
            images: request.images.iter().map(|v| STANDARD.encode(v)).collect(),
            stream: false,
            format: request.format.as_ref(),
            think: request.think,
            options: OllamaOptions {
                temperature: request.temperature,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::from_reqwest(&request.model, self.timeout, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| InferenceError::from_reqwest(&request.model, self.timeout, e))?;
        if !status.is_success() {
            return Err(Self::error_from_status(&request.model, status, &text));
        }

        let parsed: OllamaGenerateResponse = serde_json::from_str(&text)
            .map_err(|e| InferenceError::MalformedResponse(format!("{e}: {text}")))?;
        debug!("Ollama answered with {} characters", parsed.response.len());

        Ok(GenerateResponse {
            model: parsed.model,
            response: parsed.response,
            thinking: parsed.thinking.filter(|v| !v.is_empty()),
        })
    }
}
