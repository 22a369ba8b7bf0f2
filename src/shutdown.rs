use tokio::signal::unix::{signal, SignalKind};

use crate::server::{Server, StopReason};

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// The server is stopped with the matching reason when either signal
/// arrives, so `block` reports whether the stop came from a TERM or an INT.
pub fn install_shutdown_handler(server: &Server) {
    let stopper = server.stopper();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, initiating graceful shutdown");
                stopper.stop(StopReason::Term);
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, initiating graceful shutdown");
                stopper.stop(StopReason::Int);
            }
        }
    });
}
