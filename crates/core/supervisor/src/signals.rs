//! Daemon signal plumbing shared by the three server shells.

use tokio::signal::unix::{signal, Signal, SignalKind};

/// Returns a future that completes when a shutdown signal is received.
pub async fn shutdown_signal() {
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => tracing::info!(signal = "SIGINT", "shutdown signal"),
        _ = sigterm.recv() => tracing::info!(signal = "SIGTERM", "shutdown signal"),
    }
}

/// A stream of SIGHUP deliveries, used to trigger config reloads.
pub fn reload_signal() -> std::io::Result<Signal> {
    signal(SignalKind::hangup())
}
