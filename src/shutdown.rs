use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Listen for SIGTERM and SIGINT and cancel the returned token on the first one.
///
/// The manager finalizes every held transaction and the worker releases its
/// in-flight jobs once the token fires, so no record lock outlives the process.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = cancel.cancelled() => return,
        };
        tracing::info!(signal = name, "Received shutdown signal, draining");
        cancel.cancel();
    });

    Ok(token)
}
