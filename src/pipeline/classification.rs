use std::sync::Arc;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::{
    inference::{GenerateRequest, InferenceClient, InferenceError},
    taxonomy::TaxonomySnapshot,
};

use super::{
    error::{PipelineError, StageFailure},
    perception::StageExchange,
    prompts,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    /// Always an id of the run's snapshot or `idle`.
    pub activity_id: String,
    pub reasoning: Option<String>,
    pub secondary_context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClassificationOutput {
    main_activity: String,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Maps a scene description onto exactly one id of a taxonomy snapshot.
pub struct ClassificationStage {
    client: Arc<dyn InferenceClient>,
    model: String,
}

/// Unconstrained models like to wrap their json in a markdown fence.
fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(inner) = text.strip_prefix("```") else {
        return text;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

impl ClassificationStage {
    pub fn new(client: Arc<dyn InferenceClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    #[instrument(skip_all, fields(model = %self.model, provider = self.client.provider_name()))]
    pub async fn classify(
        &self,
        scene_description: &str,
        taxonomy: &TaxonomySnapshot,
        secondary_context: Option<&str>,
    ) -> Result<(ClassificationResult, StageExchange), StageFailure> {
        let mut request = GenerateRequest::new(
            &self.model,
            prompts::classification_prompt(taxonomy, scene_description, secondary_context),
        );
        request.think = true;
        if self.client.supports_structured_output() {
            request.format = Some(prompts::classification_schema(taxonomy));
        } else {
            warn!("Provider can't constrain its output, validating the answer afterwards");
        }
        let prompt = request.prompt.clone();

        let start = Instant::now();
        let response = self.client.generate(request).await?;
        info!("Classification took {:?}", start.elapsed());

        let exchange = StageExchange {
            prompt,
            raw_response: response.response.clone(),
            thinking: response.thinking.clone(),
        };

        match Self::interpret(&response.response, taxonomy, secondary_context) {
            Ok(result) => {
                info!("Classified as {}", result.activity_id);
                Ok((result, exchange))
            }
            Err(error) => Err(StageFailure::answered(error, exchange)),
        }
    }

    fn interpret(
        response: &str,
        taxonomy: &TaxonomySnapshot,
        secondary_context: Option<&str>,
    ) -> Result<ClassificationResult, PipelineError> {
        let output: ClassificationOutput = serde_json::from_str(strip_code_fence(response))
            .map_err(|e| {
                InferenceError::MalformedResponse(format!("classification {e}: {response}"))
            })?;

        // Constrained generation is trusted but still verified.
        let activity_id = output.main_activity.trim().to_string();
        if !taxonomy.allows(&activity_id) {
            return Err(PipelineError::SchemaViolation {
                activity_id,
                allowed: taxonomy
                    .allowed_ids()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            });
        }

        Ok(ClassificationResult {
            activity_id,
            reasoning: output
                .reasoning
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            secondary_context: secondary_context
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        })
    }
}
