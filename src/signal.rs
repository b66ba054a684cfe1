//! Shutdown-signal bridge.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::debug;

static REGISTERED: AtomicBool = AtomicBool::new(false);

/// Registers for SIGINT/SIGTERM and returns a token cancelled on the first
/// signal; a second signal terminates the process. May be called once per
/// process.
pub fn shutdown_token() -> Result<CancellationToken> {
    if REGISTERED.swap(true, Ordering::SeqCst) {
        bail!("shutdown signals already registered");
    }

    let mut interrupt = signal(SignalKind::interrupt()).context("error registering SIGINT")?;
    let mut terminate = signal(SignalKind::terminate()).context("error registering SIGTERM")?;

    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }

        debug!("received shutdown signal, exiting");
        cancel.cancel();

        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }

        std::process::exit(1);
    });

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_registration_faults() {
        let first = shutdown_token();
        assert!(first.is_ok());
        assert!(!first.unwrap().is_cancelled());

        assert!(shutdown_token().is_err());
    }
}
