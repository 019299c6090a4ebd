use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler for SIGTERM and SIGINT.
///
/// The first signal cancels the returned token; agent and engine loops
/// observe it, finish in-flight supervisor commands and release held
/// leases before exiting. A second signal aborts the process without
/// waiting for the drain.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, draining before shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, draining before shutdown");
            }
        }
        token_clone.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::warn!("Second signal received, exiting immediately");
        std::process::exit(130);
    });

    token
}
