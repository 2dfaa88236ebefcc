//! # OS signal handling for embedding binaries.
//!
//! The agent itself only reacts to its root [`CancellationToken`]; wiring
//! process signals to that token is the embedder's job:
//!
//! ```rust,no_run
//! # async fn demo() {
//! use tokio_util::sync::CancellationToken;
//!
//! let token = CancellationToken::new();
//! let shutdown = token.clone();
//! tokio::spawn(async move {
//!     if let Ok(signal) = synagent::os_signals::wait_for_shutdown_signal().await {
//!         tracing::info!(signal, "shutdown signal received");
//!     }
//!     shutdown.cancel();
//! });
//! # }
//! ```
//!
//! On Unix this listens for `SIGINT` (Ctrl-C), `SIGTERM` (kubelet/systemd)
//! and `SIGQUIT`; elsewhere only Ctrl-C is available.

use tokio_util::sync::CancellationToken;

/// Completes when the process receives a termination signal, returning the
/// signal's name for the shutdown log.
///
/// Each call installs independent listeners; registration failures surface
/// as the `Err` variant.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    Ok(name)
}

/// Completes when the process receives Ctrl-C, returning the signal's name.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

/// Convenience wiring: spawns a listener that cancels `token` on the first
/// termination signal.
pub fn cancel_on_shutdown_signal(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(signal) => tracing::info!(signal, "shutdown signal received"),
            Err(e) => tracing::warn!(err = %e, "cannot listen for shutdown signals"),
        }
        token.cancel();
    });
}
