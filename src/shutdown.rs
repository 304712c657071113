use tokio_util::sync::CancellationToken;

/// Why we are shutting down (useful for logs + tests).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ShutdownReason {
    CtrlC,
    Sigterm,
    OutputClosed, // e.g. broken pipe / downstream closed
}

#[derive(Clone)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels on Ctrl+C or SIGTERM, whichever comes first.
    pub fn listen_for_signals(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                r = wait_ctrl_c(&shutdown) => r,
                r = wait_sigterm(&shutdown) => r,
                _ = shutdown.token.cancelled() => return,
            };
            tracing::info!(reason = ?reason, "shutting down");
        });
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for Ctrl+C (SIGINT) and cancels the token.
/// Returns the reason so caller can log it.
pub async fn wait_ctrl_c(shutdown: &Shutdown) -> ShutdownReason {
    let _ = tokio::signal::ctrl_c().await;
    shutdown.cancel();
    ShutdownReason::CtrlC
}

/// Wait for SIGTERM on Unix (Linux/macOS). On non-Unix, this future never completes.
#[cfg(unix)]
pub async fn wait_sigterm(shutdown: &Shutdown) -> ShutdownReason {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
            shutdown.cancel();
            ShutdownReason::Sigterm
        }
        Err(_) => {
            // If we can't register, just never fire.
            std::future::pending::<()>().await;
            ShutdownReason::Sigterm
        }
    }
}

#[cfg(not(unix))]
pub async fn wait_sigterm(_shutdown: &Shutdown) -> ShutdownReason {
    std::future::pending::<()>().await;
    ShutdownReason::Sigterm
}
