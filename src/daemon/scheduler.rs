use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    pipeline::{
        error::{PipelineError, RunFailure},
        orchestrator::{PipelineOrchestrator, RunOutcome},
    },
    storage::activity_log::ActivityLog,
    utils::clock::Clock,
};

/// Invokes the pipeline once per interval until cancelled.
pub struct TrackingScheduler<L: ActivityLog> {
    pipeline: Arc<PipelineOrchestrator<L>>,
    interval: Duration,
    shutdown: CancellationToken,
    clock: Box<dyn Clock>,
}

fn report(result: &Result<RunOutcome, RunFailure>) {
    match result {
        Ok(RunOutcome::Skipped(decision)) => debug!("Skipped ({decision})"),
        Ok(_) => (),
        Err(failure) => match &failure.error {
            PipelineError::SchemaViolation {
                activity_id,
                allowed,
            } => error!(
                "Classification escaped the taxonomy ({activity_id:?} not in {allowed:?}). The \
                 prompt or output schema is broken, not the model"
            ),
            PipelineError::StorageError {
                entry: Some(entry), ..
            } => error!("Lost classified entry {entry:?}: {failure}"),
            _ => error!("Tracking run failed while {}: {}", failure.stage, failure.error),
        },
    }
}

impl<L: ActivityLog> TrackingScheduler<L> {
    pub fn new(
        pipeline: Arc<PipelineOrchestrator<L>>,
        interval: Duration,
        shutdown: CancellationToken,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            pipeline,
            interval,
            shutdown,
            clock,
        }
    }

    /// Executes the scheduler loop. Ticks sit on an absolute grid, a run that overruns its
    /// interval makes the missed ticks drop instead of firing in a burst.
    pub async fn run(self) -> Result<()> {
        info!("Tracking every {:?}", self.interval);
        let mut tick = self.clock.instant();
        loop {
            tick += self.interval;

            report(&self.pipeline.run_once(false).await);

            let now = self.clock.instant();
            if tick <= now {
                warn!("Tracking run took longer than the interval");
                while tick <= now {
                    tick += self.interval;
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Scheduler stopped");
                    return Ok(())
                }
                _ = self.clock.sleep_until(tick) => ()
            }
        }
    }
}
