use std::sync::Arc;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::{
    environment::EnvironmentSample,
    inference::{GenerateRequest, GenerateResponse, InferenceClient, InferenceError},
};

use super::{
    error::{PipelineError, StageFailure},
    prompts,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerceptionResult {
    pub scene_description: String,
    /// What other displays show, only reported when there is more than one.
    pub secondary_context: Option<String>,
}

/// Prompt and raw answer of one model call, kept for the sampling side channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageExchange {
    pub prompt: String,
    pub raw_response: String,
    pub thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MultiScreenDescription {
    primary_screen: usize,
    main_activity_description: String,
    #[serde(default)]
    secondary_context: Option<String>,
}

/// Turns captured frames into a free-text description of what the user is doing.
pub struct PerceptionStage {
    client: Arc<dyn InferenceClient>,
    model: String,
}

impl PerceptionStage {
    pub fn new(client: Arc<dyn InferenceClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    #[instrument(skip_all, fields(screens = sample.frames.len(), model = %self.model))]
    pub async fn describe(
        &self,
        sample: &EnvironmentSample,
    ) -> Result<(PerceptionResult, StageExchange), StageFailure> {
        let multi_screen = sample.frames.len() > 1;
        let app_name = sample.frontmost_app_name.as_deref();
        let mut request = GenerateRequest::new(
            &self.model,
            if multi_screen {
                prompts::multi_screen_prompt(sample.active_screen_index, app_name)
            } else {
                prompts::single_screen_prompt(app_name)
            },
        );
        request.images = sample.frames.iter().map(|v| v.image.clone()).collect();
        if multi_screen {
            request.format = Some(prompts::multi_screen_schema());
        }
        let prompt = request.prompt.clone();

        let start = Instant::now();
        let response = self.client.generate(request).await?;
        info!("Perception took {:?}", start.elapsed());

        let exchange = StageExchange {
            prompt,
            raw_response: response.response.clone(),
            thinking: response.thinking.clone(),
        };
        match Self::interpret(sample, response) {
            Ok(result) => {
                debug!("Scene: {}", result.scene_description);
                Ok((result, exchange))
            }
            Err(error) => Err(StageFailure::answered(error, exchange)),
        }
    }

    fn interpret(
        sample: &EnvironmentSample,
        response: GenerateResponse,
    ) -> Result<PerceptionResult, PipelineError> {
        let result = if sample.frames.len() > 1 {
            // Some vision models put the structured answer into their thinking output.
            let raw = if response.response.trim().is_empty() {
                response.thinking.as_deref().unwrap_or_default()
            } else {
                response.response.as_str()
            };
            let parsed: MultiScreenDescription = serde_json::from_str(raw.trim()).map_err(|e| {
                InferenceError::MalformedResponse(format!("screen description {e}: {raw}"))
            })?;
            if !(1..=sample.frames.len()).contains(&parsed.primary_screen) {
                warn!(
                    "Model chose screen {} out of {}",
                    parsed.primary_screen,
                    sample.frames.len()
                );
            }
            PerceptionResult {
                scene_description: parsed.main_activity_description.trim().to_string(),
                secondary_context: parsed
                    .secondary_context
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty()),
            }
        } else {
            PerceptionResult {
                scene_description: response.response.trim().to_string(),
                secondary_context: None,
            }
        };

        if result.scene_description.is_empty() {
            return Err(InferenceError::MalformedResponse("empty scene description".into()).into());
        }
        Ok(result)
    }
}
