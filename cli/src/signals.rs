//! Termination signal handling.

use std::future::Future;

use tracing::info;

/// Register termination handlers and return a future that resolves on the
/// first SIGTERM, SIGINT or SIGQUIT.
///
/// Handlers stay installed for the life of the process, so signals delivered
/// during the shutdown flush are absorbed instead of killing it.
#[cfg(unix)]
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;

    Ok(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = sigquit.recv() => "SIGQUIT",
        };
        info!(signal = name, "termination requested");
    })
}

#[cfg(not(unix))]
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    Ok(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(signal = "ctrl-c", "termination requested");
        }
    })
}
