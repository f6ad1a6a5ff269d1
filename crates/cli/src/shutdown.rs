//! Graceful shutdown on SIGINT and SIGTERM
//!
//! The first signal cancels the run: no further tasks are dispatched and
//! in-flight tasks finish and are cached. A second signal exits immediately.

use crate::cli::EXIT_SIGINT;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancel `token` when the process is asked to stop
pub fn install_signal_handlers(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut signals = match Signals::new() {
            Ok(signals) => signals,
            Err(e) => {
                warn!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

        let name = signals.recv().await;
        info!(signal = name, "Stopping dispatch; running tasks will finish");
        token.cancel();

        let name = signals.recv().await;
        warn!(signal = name, "Second signal received, exiting");
        std::process::exit(EXIT_SIGINT);
    })
}

#[cfg(unix)]
struct Signals {
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigint.recv() => "SIGINT",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    #[allow(clippy::unnecessary_wraps)]
    const fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        "Ctrl+C"
    }
}
