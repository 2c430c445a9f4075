//! The recurring tracking pipeline.
//!
//! A run goes through the gate, captures the displays, asks a vision model to describe them and
//! a text model to classify the description, then appends the result to the day's record.
//! [orchestrator::PipelineOrchestrator::run_once] is the only entry point, scheduling happens
//! outside of it.

pub mod classification;
pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod pause;
pub mod perception;
pub mod prompts;
pub mod sampling;

use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::{
    config::{TrackerConfig, TAXONOMY_FILE_NAME},
    environment::GenericEnvironment,
    inference::{create_text_client, create_vision_client},
    storage::activity_log::JsonActivityLog,
    taxonomy::store::FileTaxonomyStore,
    utils::clock::DefaultClock,
};

use self::{
    classification::ClassificationStage,
    gate::GateEvaluator,
    orchestrator::{PipelineOrchestrator, PipelineParts},
    pause::PauseMarker,
    perception::PerceptionStage,
    sampling::{DirectorySampleSink, SampleSink},
};

pub const RECORDS_DIR_NAME: &str = "records";

/// Builds the pipeline used by `zeit track` and the daemon from the effective configuration.
pub fn create_pipeline(
    config: &TrackerConfig,
    application_path: &Path,
) -> Result<PipelineOrchestrator<JsonActivityLog>> {
    let sample_sink = if config.sampling.enabled {
        let dir = config.sampling_dir(application_path);
        info!("Sampling runs into {dir:?}");
        Some(Box::new(DirectorySampleSink::new(dir)) as Box<dyn SampleSink>)
    } else {
        None
    };

    Ok(PipelineOrchestrator::new(PipelineParts {
        environment: Box::new(GenericEnvironment::new()?),
        perception: PerceptionStage::new(
            create_vision_client(&config.models)?,
            &config.models.vision,
        ),
        classification: ClassificationStage::new(
            create_text_client(&config.models)?,
            &config.models.text,
        ),
        taxonomy: Box::new(FileTaxonomyStore::new(
            application_path.join(TAXONOMY_FILE_NAME),
        )),
        log: JsonActivityLog::new(application_path.join(RECORDS_DIR_NAME))?,
        pause: Box::new(PauseMarker::new(config.pause_marker_path(application_path))),
        clock: Box::new(DefaultClock),
        gate: GateEvaluator::new(config.work_schedule(), config.idle_threshold()),
        sample_sink,
    }))
}
