use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Waits for ctrl-c, a termination signal or for `cancelation` being cancelled by someone else.
///
/// On Windows detached processes can't detect signals sent to them, there `zeit stop` simply
/// kills the daemon.
pub async fn detect_shutdown(cancelation: CancellationToken) {
    select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received ctrl-c");
            cancelation.cancel();
        },
        _ = terminate() => {
            info!("Received termination signal");
            cancelation.cancel();
        },
        _ = cancelation.cancelled() => (),
    };
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            tracing::warn!("Failed to listen for SIGTERM {e:?}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
