//! SIGTERM and SIGINT handling.
//!
//! Core work runs on a blocking thread that cannot be cancelled, so an
//! interrupted invocation exits straight away and leaves the run lock for
//! the next acquire to reclaim.

use tokio::signal;
use tracing::{info, warn};

/// Resolves with the name of the first termination signal received.
pub async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let name = tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    info!(signal = name, "Received termination signal");
    name
}
