use chrono::{DateTime, FixedOffset, NaiveDate};
use tokio::sync::Mutex;
use tracing::{error, info, info_span, Instrument};

use crate::{
    environment::{self, CapturedFrame, EnvironmentSample, EnvironmentSampler},
    storage::{activity_log::ActivityLog, entities::ActivityEntry},
    taxonomy::{
        store::{load_snapshot, TaxonomySource},
        TaxonomySnapshot,
    },
    utils::clock::Clock,
};

use super::{
    classification::ClassificationStage,
    error::{PipelineError, RunFailure, Stage, StageFailure},
    gate::{GateDecision, GateEvaluator},
    pause::PauseSignal,
    perception::{PerceptionResult, PerceptionStage, StageExchange},
    sampling::{RunArtifacts, SampleResult, SampleSink},
};

/// How a run that didn't fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Recorded(ActivityEntry),
    /// The user was away, an idle entry was stored without capturing anything.
    RecordedIdle(ActivityEntry),
    /// The gate stopped the run before anything happened.
    Skipped(GateDecision),
}

/// Transitions of a single run. Every state either moves forward or fails the run. The taxonomy
/// snapshot is taken once the gate lets the run through and is carried to classification.
enum RunState {
    Gating,
    Capturing {
        idle_time: std::time::Duration,
        taxonomy: TaxonomySnapshot,
    },
    Perceiving {
        sample: EnvironmentSample,
        taxonomy: TaxonomySnapshot,
    },
    Classifying {
        perception: PerceptionResult,
        taxonomy: TaxonomySnapshot,
    },
    Recording {
        entry: ActivityEntry,
        idle: bool,
    },
    Done(RunOutcome),
}

/// Intermediate artifacts kept for the sampling side channel.
#[derive(Default)]
struct RunTrace {
    frames: Vec<CapturedFrame>,
    perception: Option<StageExchange>,
    classification: Option<StageExchange>,
}

impl RunTrace {
    /// Keeps whatever the failed stage exchanged with its model.
    fn fail(&mut self, stage: Stage, failure: StageFailure) -> RunFailure {
        match stage {
            Stage::Perceiving => self.perception = failure.exchange,
            Stage::Classifying => self.classification = failure.exchange,
            _ => {}
        }
        RunFailure::new(stage, failure.error)
    }
}

/// Moment of a run, fixed when it starts.
struct RunContext {
    moment: DateTime<FixedOffset>,
    date: NaiveDate,
    force: bool,
}

/// Everything a [PipelineOrchestrator] coordinates.
pub struct PipelineParts<L: ActivityLog> {
    pub environment: Box<dyn EnvironmentSampler>,
    pub perception: PerceptionStage,
    pub classification: ClassificationStage,
    pub taxonomy: Box<dyn TaxonomySource>,
    pub log: L,
    pub pause: Box<dyn PauseSignal>,
    pub clock: Box<dyn Clock>,
    pub gate: GateEvaluator,
    pub sample_sink: Option<Box<dyn SampleSink>>,
}

/// Sequences gate, capture, both model stages and the append. Runs are serialized: the
/// environment lock is held from gating until the entry is stored.
pub struct PipelineOrchestrator<L: ActivityLog> {
    environment: Mutex<Box<dyn EnvironmentSampler>>,
    perception: PerceptionStage,
    classification: ClassificationStage,
    taxonomy: Box<dyn TaxonomySource>,
    log: L,
    pause: Box<dyn PauseSignal>,
    clock: Box<dyn Clock>,
    gate: GateEvaluator,
    sample_sink: Option<Box<dyn SampleSink>>,
}

impl<L: ActivityLog> PipelineOrchestrator<L> {
    pub fn new(parts: PipelineParts<L>) -> Self {
        Self {
            environment: Mutex::new(parts.environment),
            perception: parts.perception,
            classification: parts.classification,
            taxonomy: parts.taxonomy,
            log: parts.log,
            pause: parts.pause,
            clock: parts.clock,
            gate: parts.gate,
            sample_sink: parts.sample_sink,
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// Executes one tracking iteration. `force` bypasses every gate check.
    pub async fn run_once(&self, force: bool) -> Result<RunOutcome, RunFailure> {
        let mut environment = self.environment.lock().await;
        let now = self.clock.local_time();
        let context = RunContext {
            moment: now.fixed_offset(),
            date: now.date_naive(),
            force,
        };
        let span = info_span!("Tracking run", moment = %context.moment, force);

        let mut trace = RunTrace::default();
        let result = self
            .drive(&mut **environment, &context, &mut trace)
            .instrument(span)
            .await;

        match &result {
            Ok(RunOutcome::Skipped(decision)) => info!("Run skipped: {decision}"),
            Ok(RunOutcome::Recorded(entry)) => info!("Recorded {}", entry.activity_id),
            Ok(RunOutcome::RecordedIdle(_)) => info!("Recorded idle"),
            Err(e) => error!("Run failed {e}"),
        }

        if let Some(sink) = &self.sample_sink {
            // Runs that never captured anything have nothing worth sampling.
            if !trace.frames.is_empty() {
                let sample_result = match &result {
                    Ok(RunOutcome::Recorded(entry)) => Some(SampleResult::Recorded {
                        entry: entry.clone(),
                    }),
                    Err(failure) => Some(SampleResult::from(failure)),
                    Ok(_) => None,
                };
                if let Some(sample_result) = sample_result {
                    sink.record(&RunArtifacts {
                        moment: context.moment,
                        frames: trace.frames,
                        perception: trace.perception,
                        classification: trace.classification,
                        result: sample_result,
                    })
                    .await;
                }
            }
        }

        result
    }

    async fn drive(
        &self,
        environment: &mut dyn EnvironmentSampler,
        context: &RunContext,
        trace: &mut RunTrace,
    ) -> Result<RunOutcome, RunFailure> {
        let mut state = RunState::Gating;
        loop {
            state = match self.step(state, environment, context, trace).await? {
                RunState::Done(outcome) => return Ok(outcome),
                next => next,
            };
        }
    }

    async fn step(
        &self,
        state: RunState,
        environment: &mut dyn EnvironmentSampler,
        context: &RunContext,
        trace: &mut RunTrace,
    ) -> Result<RunState, RunFailure> {
        Ok(match state {
            RunState::Gating => {
                let paused = self.pause.is_paused().await;
                let idle_time = environment::read_idle_time(environment);
                let decision = self.gate.evaluate(
                    context.moment.naive_local(),
                    paused,
                    idle_time,
                    context.force,
                );
                match decision {
                    GateDecision::Proceed => RunState::Capturing {
                        idle_time,
                        taxonomy: self
                            .snapshot()
                            .await
                            .map_err(|e| RunFailure::new(Stage::Gating, e))?,
                    },
                    GateDecision::SkipIdle => RunState::Recording {
                        entry: ActivityEntry::idle(context.moment),
                        idle: true,
                    },
                    GateDecision::SkipPaused | GateDecision::SkipOutsideWorkHours => {
                        RunState::Done(RunOutcome::Skipped(decision))
                    }
                }
            }
            RunState::Capturing {
                idle_time,
                taxonomy,
            } => {
                let sample = environment::capture_sample(environment, idle_time)
                    .map_err(|e| RunFailure::new(Stage::Capturing, e))?;
                trace.frames = sample.frames.clone();
                RunState::Perceiving { sample, taxonomy }
            }
            RunState::Perceiving { sample, taxonomy } => {
                let (perception, exchange) = self
                    .perception
                    .describe(&sample)
                    .await
                    .map_err(|e| trace.fail(Stage::Perceiving, e))?;
                trace.perception = Some(exchange);
                RunState::Classifying {
                    perception,
                    taxonomy,
                }
            }
            RunState::Classifying {
                perception,
                taxonomy,
            } => {
                let (classification, exchange) = self
                    .classification
                    .classify(
                        &perception.scene_description,
                        &taxonomy,
                        perception.secondary_context.as_deref(),
                    )
                    .await
                    .map_err(|e| trace.fail(Stage::Classifying, e))?;
                trace.classification = Some(exchange);
                RunState::Recording {
                    entry: ActivityEntry::new(
                        context.moment,
                        classification.activity_id,
                        classification.reasoning,
                        Some(perception.scene_description),
                        classification.secondary_context,
                    ),
                    idle: false,
                }
            }
            RunState::Recording { entry, idle } => {
                if let Err(error) = self.log.append_entry(context.date, &entry).await {
                    return Err(RunFailure::new(
                        Stage::Recording,
                        PipelineError::StorageError {
                            entry: Some(Box::new(entry)),
                            error,
                        },
                    ));
                }
                RunState::Done(if idle {
                    RunOutcome::RecordedIdle(entry)
                } else {
                    RunOutcome::Recorded(entry)
                })
            }
            RunState::Done(outcome) => RunState::Done(outcome),
        })
    }

    /// Reads the taxonomy once for this run.
    async fn snapshot(&self) -> Result<TaxonomySnapshot, PipelineError> {
        load_snapshot(self.taxonomy.as_ref())
            .await
            .map_err(|error| PipelineError::StorageError { entry: None, error })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
    use image::{DynamicImage, RgbImage};
    use tempfile::{tempdir, TempDir};

    use crate::{
        config::TrackerConfig,
        environment::{ActiveWindowHint, MockEnvironmentSampler},
        inference::{GenerateResponse, InferenceError, MockInferenceClient},
        pipeline::{
            classification::ClassificationStage,
            error::{PipelineError, Stage},
            gate::{GateDecision, GateEvaluator},
            pause::MockPauseSignal,
            perception::PerceptionStage,
            sampling::{DirectorySampleSink, SampleSink},
        },
        storage::{
            activity_log::{ActivityLog, JsonActivityLog},
            entities::{ActivityEntry, DayRecord},
        },
        taxonomy::{
            store::{FileTaxonomyStore, TaxonomySource},
            ActivityCategory, ActivityTypeDefinition,
        },
        utils::{clock::FixedClock, logging::TEST_LOGGING},
    };

    use super::{PipelineOrchestrator, PipelineParts, RunOutcome};

    struct StaticTaxonomy(Vec<ActivityTypeDefinition>);

    #[async_trait]
    impl TaxonomySource for StaticTaxonomy {
        async fn activity_types(&self) -> Result<Vec<ActivityTypeDefinition>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenLog;

    impl ActivityLog for BrokenLog {
        async fn get_day_record(&self, _: NaiveDate) -> Result<Option<DayRecord>> {
            Ok(None)
        }

        async fn append_entry(&self, _: NaiveDate, _: &ActivityEntry) -> Result<()> {
            Err(anyhow!("disk full"))
        }
    }

    fn taxonomy() -> StaticTaxonomy {
        StaticTaxonomy(vec![
            ActivityTypeDefinition::new("Work Coding", "Writing code", ActivityCategory::Work)
                .unwrap(),
            ActivityTypeDefinition::new(
                "Personal Browsing",
                "Browsing for fun",
                ActivityCategory::Personal,
            )
            .unwrap(),
        ])
    }

    /// Tuesday 2025-03-04 at `hour` local time, or Saturday 2025-03-08 when `saturday` is set.
    fn local_moment(saturday: bool, hour: u32) -> DateTime<Utc> {
        let day = if saturday { 8 } else { 4 };
        let naive: NaiveDateTime = NaiveDate::from_ymd_opt(2025, 3, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap();
        Local
            .from_local_datetime(&naive)
            .earliest()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn environment(idle_secs: u64, screens: usize) -> MockEnvironmentSampler {
        let mut environment = MockEnvironmentSampler::new();
        environment
            .expect_idle_time()
            .returning(move || Ok(Duration::from_secs(idle_secs)));
        environment.expect_active_window().returning(|| {
            Ok(ActiveWindowHint {
                screen_index: 1,
                app_name: Some("code".into()),
            })
        });
        environment.expect_capture_screens().returning(move || {
            Ok((0..screens)
                .map(|_| DynamicImage::ImageRgb8(RgbImage::new(64, 48)))
                .collect())
        });
        environment
    }

    fn vision(calls: usize) -> MockInferenceClient {
        let mut client = MockInferenceClient::new();
        client.expect_provider_name().return_const("ollama");
        client.expect_supports_structured_output().return_const(true);
        client.expect_generate().times(calls).returning(|_| {
            Ok(GenerateResponse {
                model: "qwen3-vl:4b".into(),
                response: "An editor with Rust code".into(),
                thinking: None,
            })
        });
        client
    }

    fn text(
        structured: bool,
        calls: usize,
        answer: Result<&'static str, Duration>,
    ) -> MockInferenceClient {
        let mut client = MockInferenceClient::new();
        client.expect_provider_name().return_const("test");
        client
            .expect_supports_structured_output()
            .return_const(structured);
        client
            .expect_generate()
            .times(calls)
            .returning(move |_| match answer {
                Ok(response) => Ok(GenerateResponse {
                    model: "qwen3:8b".into(),
                    response: response.into(),
                    thinking: Some("thinking".into()),
                }),
                Err(timeout) => Err(InferenceError::Timeout(timeout)),
            });
        client
    }

    fn paused(value: bool) -> MockPauseSignal {
        let mut pause = MockPauseSignal::new();
        pause.expect_is_paused().return_const(value);
        pause
    }

    fn gate() -> GateEvaluator {
        GateEvaluator::new(
            TrackerConfig::default().work_schedule(),
            Duration::from_secs(300),
        )
    }

    struct Harness {
        environment: MockEnvironmentSampler,
        vision: MockInferenceClient,
        text: MockInferenceClient,
        taxonomy: Box<dyn TaxonomySource>,
        pause: MockPauseSignal,
        moment: DateTime<Utc>,
        gate: GateEvaluator,
        sample_dir: Option<PathBuf>,
    }

    impl Harness {
        fn new(
            environment: MockEnvironmentSampler,
            vision: MockInferenceClient,
            text: MockInferenceClient,
        ) -> Self {
            Self {
                environment,
                vision,
                text,
                taxonomy: Box::new(taxonomy()),
                pause: paused(false),
                moment: local_moment(false, 10),
                gate: gate(),
                sample_dir: None,
            }
        }

        fn build<L: ActivityLog>(self, log: L) -> PipelineOrchestrator<L> {
            PipelineOrchestrator::new(PipelineParts {
                environment: Box::new(self.environment),
                perception: PerceptionStage::new(Arc::new(self.vision), "qwen3-vl:4b"),
                classification: ClassificationStage::new(Arc::new(self.text), "qwen3:8b"),
                taxonomy: self.taxonomy,
                log,
                pause: Box::new(self.pause),
                clock: Box::new(FixedClock(self.moment)),
                gate: self.gate,
                sample_sink: self
                    .sample_dir
                    .map(|v| Box::new(DirectorySampleSink::new(v)) as Box<dyn SampleSink>),
            })
        }
    }

    fn temp_log() -> Result<(TempDir, JsonActivityLog)> {
        let dir = tempdir()?;
        let log = JsonActivityLog::new(dir.path().join("records"))?;
        Ok((dir, log))
    }

    fn today(moment: DateTime<Utc>) -> NaiveDate {
        moment.with_timezone(&Local).date_naive()
    }

    const WORK_CODING: &str = r#"{"main_activity": "work_coding", "reasoning": "An IDE"}"#;

    #[tokio::test]
    async fn saturday_is_outside_work_hours() -> Result<()> {
        *TEST_LOGGING;
        let (_dir, log) = temp_log()?;
        let mut harness =
            Harness::new(environment(0, 1), vision(0), text(true, 0, Ok(WORK_CODING)));
        harness.moment = local_moment(true, 10);
        let moment = harness.moment;
        let pipeline = harness.build(log);

        assert_eq!(
            pipeline.run_once(false).await?,
            RunOutcome::Skipped(GateDecision::SkipOutsideWorkHours)
        );
        assert_eq!(pipeline.log().get_day_record(today(moment)).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn empty_work_days_never_track() -> Result<()> {
        let (_dir, log) = temp_log()?;
        let config: TrackerConfig = serde_json::from_str(r#"{"work_days": []}"#)?;
        let mut harness =
            Harness::new(environment(0, 1), vision(0), text(true, 0, Ok(WORK_CODING)));
        harness.gate = GateEvaluator::new(config.work_schedule(), config.idle_threshold());
        let pipeline = harness.build(log);

        assert_eq!(
            pipeline.run_once(false).await?,
            RunOutcome::Skipped(GateDecision::SkipOutsideWorkHours)
        );
        Ok(())
    }

    #[tokio::test]
    async fn paused_runs_do_nothing() -> Result<()> {
        let (_dir, log) = temp_log()?;
        let mut harness =
            Harness::new(environment(0, 1), vision(0), text(true, 0, Ok(WORK_CODING)));
        harness.pause = paused(true);
        let pipeline = harness.build(log);

        assert_eq!(
            pipeline.run_once(false).await?,
            RunOutcome::Skipped(GateDecision::SkipPaused)
        );
        Ok(())
    }

    #[tokio::test]
    async fn idle_user_gets_an_idle_entry_without_inference() -> Result<()> {
        *TEST_LOGGING;
        let (_dir, log) = temp_log()?;
        let mut environment = MockEnvironmentSampler::new();
        environment
            .expect_idle_time()
            .returning(|| Ok(Duration::from_secs(400)));
        environment.expect_active_window().never();
        environment.expect_capture_screens().never();
        let harness = Harness::new(environment, vision(0), text(true, 0, Ok(WORK_CODING)));
        let moment = harness.moment;
        let pipeline = harness.build(log);

        let outcome = pipeline.run_once(false).await?;
        let RunOutcome::RecordedIdle(entry) = outcome else {
            panic!("unexpected {outcome:?}");
        };
        assert!(entry.is_idle());
        assert_eq!(entry.reasoning, None);

        let record = pipeline.log().get_day_record(today(moment)).await?.unwrap();
        assert_eq!(record.entries, vec![entry]);
        Ok(())
    }

    #[tokio::test]
    async fn forced_runs_ignore_the_gate() -> Result<()> {
        let (_dir, log) = temp_log()?;
        let mut harness =
            Harness::new(environment(4000, 1), vision(1), text(true, 1, Ok(WORK_CODING)));
        harness.moment = local_moment(true, 23);
        harness.pause = paused(true);
        let pipeline = harness.build(log);

        assert!(matches!(
            pipeline.run_once(true).await?,
            RunOutcome::Recorded(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn constrained_classification_is_persisted() -> Result<()> {
        *TEST_LOGGING;
        let (_dir, log) = temp_log()?;
        let harness =
            Harness::new(environment(3, 1), vision(1), text(true, 1, Ok(WORK_CODING)));
        let moment = harness.moment;
        let pipeline = harness.build(log);
        let RunOutcome::Recorded(entry) = pipeline.run_once(false).await? else {
            panic!("entry wasn't recorded");
        };
        assert_eq!(entry.activity_id, "work_coding");
        assert_eq!(entry.reasoning.as_deref(), Some("An IDE"));
        assert_eq!(
            entry.scene_description.as_deref(),
            Some("An editor with Rust code")
        );

        let record = pipeline.log().get_day_record(today(moment)).await?.unwrap();
        assert_eq!(record.entries, vec![entry]);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_id_from_unconstrained_provider_is_a_schema_violation() -> Result<()> {
        let (_dir, log) = temp_log()?;
        let harness = Harness::new(
            environment(0, 1),
            vision(1),
            text(
                false,
                1,
                Ok(r#"{"main_activity": "deep_work", "reasoning": "focus"}"#),
            ),
        );
        let moment = harness.moment;
        let pipeline = harness.build(log);

        let failure = pipeline.run_once(false).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Classifying);
        assert!(matches!(
            failure.error,
            PipelineError::SchemaViolation { ref activity_id, .. } if activity_id == "deep_work"
        ));
        assert_eq!(pipeline.log().get_day_record(today(moment)).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn classification_timeout_leaves_the_record_unchanged() -> Result<()> {
        let (_dir, log) = temp_log()?;
        let harness = Harness::new(
            environment(0, 1),
            vision(1),
            text(true, 1, Err(Duration::from_secs(120))),
        );
        let moment = harness.moment;
        let previous = ActivityEntry::idle(moment.with_timezone(&Local).fixed_offset());
        log.append_entry(today(moment), &previous).await?;
        let pipeline = harness.build(log);

        let failure = pipeline.run_once(false).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Classifying);
        assert!(matches!(failure.error, PipelineError::InferenceError(_)));

        let record = pipeline.log().get_day_record(today(moment)).await?.unwrap();
        assert_eq!(record.entries, vec![previous]);
        Ok(())
    }

    #[tokio::test]
    async fn capture_failure_stops_the_run() -> Result<()> {
        let (_dir, log) = temp_log()?;
        let mut environment = MockEnvironmentSampler::new();
        environment
            .expect_idle_time()
            .returning(|| Ok(Duration::ZERO));
        environment
            .expect_active_window()
            .returning(|| Err(anyhow!("no window")));
        environment
            .expect_capture_screens()
            .returning(|| Err(anyhow!("permission denied")));
        let pipeline =
            Harness::new(environment, vision(0), text(true, 0, Ok(WORK_CODING))).build(log);

        let failure = pipeline.run_once(false).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Capturing);
        assert_eq!(failure.error.kind(), "CaptureUnavailable");
        Ok(())
    }

    #[tokio::test]
    async fn storage_failure_hands_back_the_entry() -> Result<()> {
        let pipeline = Harness::new(environment(0, 1), vision(1), text(true, 1, Ok(WORK_CODING)))
            .build(BrokenLog);

        let failure = pipeline.run_once(false).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Recording);
        assert_eq!(
            failure.unsaved_entry().map(|v| v.activity_id.as_str()),
            Some("work_coding")
        );
        Ok(())
    }

    #[tokio::test]
    async fn failed_runs_are_sampled() -> Result<()> {
        let (dir, log) = temp_log()?;
        let mut harness = Harness::new(
            environment(0, 1),
            vision(1),
            text(false, 1, Ok(r#"{"main_activity": "deep_work"}"#)),
        );
        harness.sample_dir = Some(dir.path().join("samples"));
        let pipeline = harness.build(log);

        assert!(pipeline.run_once(false).await.is_err());

        let mut samples = std::fs::read_dir(dir.path().join("samples"))?;
        let sample = samples.next().unwrap()?.path();
        assert!(samples.next().is_none());
        assert!(sample.join("screen_1.png").exists());
        assert!(sample.join("perception_prompt.txt").exists());
        assert!(std::fs::read_to_string(sample.join("classification_prompt.txt"))?
            .contains("An editor with Rust code"));
        assert_eq!(
            std::fs::read_to_string(sample.join("classification_response.txt"))?,
            r#"{"main_activity": "deep_work"}"#
        );
        assert_eq!(
            std::fs::read_to_string(sample.join("classification_thinking.txt"))?,
            "thinking"
        );
        let result: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(sample.join("result.json"))?)?;
        assert_eq!(result["kind"], "SchemaViolation");
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_taxonomy_falls_back_to_the_defaults() -> Result<()> {
        *TEST_LOGGING;
        let (dir, log) = temp_log()?;
        let path = dir.path().join("activity_types.json");
        std::fs::write(&path, "{ not json")?;
        let mut harness = Harness::new(
            environment(0, 1),
            vision(1),
            text(true, 1, Ok(r#"{"main_activity": "slack", "reasoning": "Chat"}"#)),
        );
        harness.taxonomy = Box::new(FileTaxonomyStore::new(path));
        let pipeline = harness.build(log);

        let RunOutcome::Recorded(entry) = pipeline.run_once(false).await? else {
            panic!("entry wasn't recorded");
        };
        assert_eq!(entry.activity_id, "slack");
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_taxonomy_fails_before_perception() -> Result<()> {
        let (dir, log) = temp_log()?;
        // A directory where the taxonomy file should be.
        let path = dir.path().join("activity_types.json");
        std::fs::create_dir(&path)?;
        let mut environment = MockEnvironmentSampler::new();
        environment
            .expect_idle_time()
            .returning(|| Ok(Duration::ZERO));
        environment.expect_capture_screens().never();
        let mut harness = Harness::new(environment, vision(0), text(true, 0, Ok(WORK_CODING)));
        harness.taxonomy = Box::new(FileTaxonomyStore::new(path));
        let moment = harness.moment;
        let pipeline = harness.build(log);

        let failure = pipeline.run_once(false).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Gating);
        assert_eq!(failure.error.kind(), "StorageError");
        assert!(failure.unsaved_entry().is_none());
        assert_eq!(pipeline.log().get_day_record(today(moment)).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn taxonomy_edits_during_a_run_wait_for_the_next_one() -> Result<()> {
        let (dir, log) = temp_log()?;
        let path = dir.path().join("activity_types.json");
        std::fs::write(&path, serde_json::to_string(&taxonomy().0)?)?;

        // The user replaces the taxonomy while the screens are being described.
        let edited = serde_json::to_string(&[
            ActivityTypeDefinition::new("Work Email", "Answering mail", ActivityCategory::Work)?,
            ActivityTypeDefinition::new("Personal Chat", "Chatting", ActivityCategory::Personal)?,
        ])?;
        let edit_path = path.clone();
        let mut vision = MockInferenceClient::new();
        vision.expect_generate().times(1).returning(move |_| {
            std::fs::write(&edit_path, &edited).unwrap();
            Ok(GenerateResponse {
                model: "qwen3-vl:4b".into(),
                response: "An editor with Rust code".into(),
                thinking: None,
            })
        });

        let mut harness =
            Harness::new(environment(0, 1), vision, text(false, 1, Ok(WORK_CODING)));
        harness.taxonomy = Box::new(FileTaxonomyStore::new(path.clone()));
        let pipeline = harness.build(log);

        let RunOutcome::Recorded(entry) = pipeline.run_once(false).await? else {
            panic!("entry wasn't recorded");
        };
        assert_eq!(entry.activity_id, "work_coding");
        let stored = FileTaxonomyStore::new(path).activity_types().await?;
        assert_eq!(stored[0].id, "work_email");
        Ok(())
    }

    #[tokio::test]
    async fn perception_failures_are_sampled() -> Result<()> {
        let (dir, log) = temp_log()?;
        // Two screens make perception expect a structured answer, which plain prose isn't.
        let mut harness =
            Harness::new(environment(0, 2), vision(1), text(true, 0, Ok(WORK_CODING)));
        harness.sample_dir = Some(dir.path().join("samples"));
        let pipeline = harness.build(log);

        let failure = pipeline.run_once(false).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Perceiving);

        let mut samples = std::fs::read_dir(dir.path().join("samples"))?;
        let sample = samples.next().unwrap()?.path();
        assert!(sample.join("screen_2.png").exists());
        assert!(std::fs::read_to_string(sample.join("perception_prompt.txt"))?
            .contains("Screen 1"));
        assert_eq!(
            std::fs::read_to_string(sample.join("perception_response.txt"))?,
            "An editor with Rust code"
        );
        assert!(!sample.join("classification_prompt.txt").exists());
        let result: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(sample.join("result.json"))?)?;
        assert_eq!(result["stage"], "Perceiving");
        assert_eq!(result["kind"], "InferenceError");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_are_serialized() -> Result<()> {
        let (_dir, log) = temp_log()?;
        let runs = 8;

        let order = Arc::new(AtomicUsize::new(0));
        let mut environment = MockEnvironmentSampler::new();
        environment
            .expect_idle_time()
            .returning(|| Ok(Duration::ZERO));
        environment.expect_active_window().returning(|| {
            Ok(ActiveWindowHint {
                screen_index: 1,
                app_name: None,
            })
        });
        environment
            .expect_capture_screens()
            .times(runs)
            .returning(|| Ok(vec![DynamicImage::ImageRgb8(RgbImage::new(8, 8))]));

        // Each perception reports its own sequence number so the stored order can be checked.
        let mut vision = MockInferenceClient::new();
        let counter = order.clone();
        vision.expect_generate().times(runs).returning(move |_| {
            let position = counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            Ok(GenerateResponse {
                model: "qwen3-vl:4b".into(),
                response: format!("Scene {position}"),
                thinking: None,
            })
        });

        let harness = Harness::new(environment, vision, text(true, runs, Ok(WORK_CODING)));
        let moment = harness.moment;
        let pipeline = Arc::new(harness.build(log));

        let handles = (0..runs)
            .map(|_| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move { pipeline.run_once(false).await })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert!(matches!(handle.await??, RunOutcome::Recorded(_)));
        }

        let record = pipeline.log().get_day_record(today(moment)).await?.unwrap();
        let scenes = record
            .entries
            .iter()
            .map(|v| v.scene_description.clone().unwrap())
            .collect::<Vec<_>>();
        let expected = (0..runs).map(|v| format!("Scene {v}")).collect::<Vec<_>>();
        assert_eq!(scenes, expected);
        Ok(())
    }
}
