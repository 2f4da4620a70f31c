use anyhow::{anyhow, Result};
use log::{debug, info};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Turns OS stop signals into a [CancellationToken] that a measurement run checks
/// between jobs. A run is never interrupted preemptively.
pub struct SignalHandler {
    tok: CancellationToken,
}

pub fn new() -> SignalHandler {
    SignalHandler {
        tok: CancellationToken::new(),
    }
}

impl SignalHandler {
    pub fn subscribe_stop(&self) -> CancellationToken {
        self.tok.clone()
    }

    /// Waits for the first stop signal and cancels the token. Also returns (without
    /// logging) if the token was cancelled by someone else, e.g. because the run finished.
    pub async fn wait_for_signal(self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        select! {
            _ = sigterm.recv() => info!("Terminated; draining in-flight probes..."),
            _ = sigint.recv() => info!("Interrupted; draining in-flight probes..."),
            _ = sighup.recv() => info!("Hangup received; draining in-flight probes..."), // used by tmux apparently
            _ = self.tok.cancelled() => {
                debug!("Stop token cancelled without a signal");
                return Ok(());
            }
        }
        self.tok.cancel();
        Ok(())
    }
}

pub async fn flatten<E>(handle: JoinHandle<Result<(), E>>) -> Result<()>
where
    E: Into<anyhow::Error>,
{
    match handle.await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) => Err(err.into()),
        Err(err) => Err(anyhow!(err)),
    }
}
