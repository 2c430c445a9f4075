use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    config::{TrackerConfig, CONFIG_FILE_NAME},
    pipeline::create_pipeline,
    utils::clock::DefaultClock,
};

use self::scheduler::TrackingScheduler;

pub mod args;
pub mod scheduler;
pub mod shutdown;

/// Represents the starting point for the daemon
pub async fn start_daemon(dir: PathBuf) -> Result<()> {
    let dir = std::fs::canonicalize(dir)?;
    std::env::set_current_dir("/")?;

    let config = TrackerConfig::load(&dir.join(CONFIG_FILE_NAME));
    info!("Starting daemon in {dir:?}");
    let pipeline = Arc::new(create_pipeline(&config, &dir)?);

    let shutdown_token = CancellationToken::new();
    let scheduler = TrackingScheduler::new(
        pipeline,
        config.interval(),
        shutdown_token.clone(),
        Box::new(DefaultClock),
    );

    let (_, scheduler_result) = tokio::join!(
        shutdown::detect_shutdown(shutdown_token.clone()),
        async {
            let result = scheduler.run().await;
            // Stops the signal listener when the scheduler ends on its own.
            shutdown_token.cancel();
            result
        },
    );

    if let Err(e) = scheduler_result {
        error!("Scheduler got an error {e:?}");
    }

    Ok(())
}
