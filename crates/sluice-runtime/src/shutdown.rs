//! Graceful shutdown with signal handling

use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Shutdown signal shared by the gateway and the signal handler
///
/// A trigger is sticky: tasks that start waiting after it fired return
/// immediately.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger shutdown
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutdown signal triggered");
        }
        self.token.cancel();
    }

    /// Check if shutdown was triggered
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until shutdown is triggered
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}

/// Signal handler for OS signals
#[derive(Debug)]
pub struct SignalHandler {
    signal: ShutdownSignal,
}

impl SignalHandler {
    /// Create a new signal handler
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }

    /// Wait for SIGINT or SIGTERM and trigger shutdown
    pub async fn run(self) {
        #[cfg(unix)]
        {
            use signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                    (Err(err), _) | (_, Err(err)) => {
                        tracing::error!(error = %err, "Failed to install signal handlers");
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                _ = sigint.recv() => tracing::info!("Received SIGINT"),
                _ = self.signal.wait() => return,
            }
            self.signal.trigger();
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                result = signal::ctrl_c() => match result {
                    Ok(()) => {
                        tracing::info!("Received Ctrl+C");
                        self.signal.trigger();
                    }
                    Err(err) => tracing::error!("Failed to listen for Ctrl+C: {}", err),
                },
                _ = self.signal.wait() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_signal_new() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
    }

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        signal.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_late_waiter_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handler_returns_after_external_trigger() {
        let signal = ShutdownSignal::new();
        let handler = tokio::spawn(SignalHandler::new(signal.clone()).run());

        signal.trigger();

        tokio::time::timeout(Duration::from_secs(1), handler)
            .await
            .unwrap()
            .unwrap();
    }
}
