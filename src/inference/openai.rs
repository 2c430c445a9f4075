use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use super::{GenerateRequest, GenerateResponse, InferenceClient, InferenceError};

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Value,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ChatChoice>,
}

/// Client of an OpenAI compatible `/chat/completions` endpoint.
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    structured_output: bool,
    client: Client,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        structured_output: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|v| !v.trim().is_empty()),
            structured_output,
            client,
            timeout,
        })
    }

    fn user_message(request: &GenerateRequest) -> ChatMessage {
        if request.images.is_empty() {
            return ChatMessage {
                role: "user",
                content: Value::String(request.prompt.clone()),
            };
        }
        let mut parts = vec![json!({"type": "text", "text": request.prompt})];
        parts.extend(request.images.iter().map(|v| {
            json!({
                "type": "image_url",
                "image_url": {"url": format!("data:image/png;base64,{}", STANDARD.encode(v))}
            })
        }));
        ChatMessage {
            role: "user",
            content: Value::Array(parts),
        }
    }

    fn response_format(&self, request: &GenerateRequest) -> Option<Value> {
        if !self.structured_output {
            return None;
        }
        request.format.as_ref().map(|schema| {
            json!({
                "type": "json_schema",
                "json_schema": {"name": "response", "schema": schema, "strict": true}
            })
        })
    }
}

#[async_trait]
impl InferenceClient for OpenAiClient {
    fn provider_name(&self) -> &'static str {
        "openai"
    }

    fn supports_structured_output(&self) -> bool {
        self.structured_output
    }

    #[instrument(skip_all, fields(model = %request.model, images = request.images.len()))]
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, InferenceError> {
        let Some(api_key) = &self.api_key else {
            return Err(InferenceError::ModelUnavailable {
                model: request.model,
                reason: "no API key configured".into(),
            });
        };

        let body = ChatRequest {
            model: &request.model,
            messages: vec![Self::user_message(&request)],
            temperature: request.temperature,
            response_format: self.response_format(&request),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::from_reqwest(&request.model, self.timeout, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| InferenceError::from_reqwest(&request.model, self.timeout, e))?;
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                return Err(InferenceError::ModelUnavailable {
                    model: request.model,
                    reason: format!("provider returned {status}: {text}"),
                })
            }
            status if !status.is_success() => {
                return Err(InferenceError::Request(format!(
                    "provider returned {status}: {text}"
                )))
            }
            _ => {}
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| InferenceError::MalformedResponse(format!("{e}: {text}")))?;
        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(InferenceError::MalformedResponse("no choices returned".into()));
        };
        debug!("Remote model answered");

        Ok(GenerateResponse {
            model: if parsed.model.is_empty() {
                request.model
            } else {
                parsed.model
            },
            response: choice.message.content.unwrap_or_default(),
            thinking: choice.message.reasoning_content.filter(|v| !v.is_empty()),
        })
    }
}
