//! SIGINT/SIGTERM handling for a running loop.
//!
//! The listener only cancels the shared token. It never touches the agent
//! process; the invoker owns termination of its child.

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Install handlers and cancel `token` on the first SIGINT or SIGTERM.
///
/// The task exits once the token is cancelled for any reason, so dropping the
/// run also retires the listener.
pub fn spawn_interrupt_listener(token: CancellationToken) -> Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {
                warn!("SIGINT received, stopping after the current agent call");
                eprintln!("\nReceived interrupt, stopping...");
                token.cancel();
            }
            _ = sigterm.recv() => {
                warn!("SIGTERM received, stopping after the current agent call");
                eprintln!("\nReceived termination request, stopping...");
                token.cancel();
            }
            () = token.cancelled() => {
                debug!("run finished, interrupt listener exiting");
            }
        }
    }))
}
