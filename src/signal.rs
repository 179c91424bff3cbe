// [[file:../fleet.note::3e7a90c1][3e7a90c1]]
use crate::common::*;

use tokio_util::sync::CancellationToken;
// 3e7a90c1 ends here

// [[file:../fleet.note::f25b8d47][f25b8d47]]
/// Wait for Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Cancel `token` when the operator interrupts us. In-flight operations
/// stop at their next suspension point.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                warn!("signal received, cancelling remote operations");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}
// f25b8d47 ends here
