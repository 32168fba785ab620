//! Consumer lifecycle state machine.
//!
//! `Created -> Started -> Draining -> Stopped`. A consumer that is stopped
//! before it ever starts goes straight to `Stopped`. `Stopped` is terminal:
//! a consumer cannot be restarted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use super::{MessagingError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Started,
    Draining,
    Stopped,
}

/// Shared lifecycle bookkeeping for consumer implementations.
pub struct Lifecycle {
    state: watch::Sender<ConsumerState>,
    shutdown: Arc<watch::Sender<bool>>,
    running: AtomicBool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConsumerState::Created);
        let (shutdown, _) = watch::channel(false);
        Self {
            state,
            shutdown: Arc::new(shutdown),
            running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Claim the right to run and start watching for termination signals.
    ///
    /// Fails if `start` was already called, or if shutdown was requested first.
    pub fn begin(&self) -> Result<ShutdownSignal> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MessagingError::Config(
                "consumer has already been started".to_string(),
            ));
        }
        if *self.shutdown.borrow() {
            self.mark_stopped();
            return Err(MessagingError::Shutdown);
        }

        let shutdown = Arc::clone(&self.shutdown);
        let mut requested = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = termination_signal() => {
                    info!("Termination signal received, shutting down consumer");
                    shutdown.send_replace(true);
                }
                _ = requested.wait_for(|requested| *requested) => {}
            }
        });

        Ok(ShutdownSignal(self.shutdown.subscribe()))
    }

    pub fn mark_started(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConsumerState::Created {
                *state = ConsumerState::Started;
                true
            } else {
                false
            }
        });
    }

    pub fn mark_draining(&self) {
        self.state.send_if_modified(|state| {
            if matches!(*state, ConsumerState::Created | ConsumerState::Started) {
                *state = ConsumerState::Draining;
                true
            } else {
                false
            }
        });
    }

    pub fn mark_stopped(&self) {
        self.shutdown.send_replace(true);
        self.state.send_replace(ConsumerState::Stopped);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Request shutdown and wait for the run loop to finish draining.
    pub async fn stop(&self) {
        self.request_shutdown();
        if !self.running.load(Ordering::SeqCst) {
            self.mark_stopped();
            return;
        }
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConsumerState::Stopped)
            .await;
    }
}

/// Receiver side of a consumer's shutdown request.
#[derive(Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    pub fn is_requested(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&mut self) {
        let _ = self.0.wait_for(|requested| *requested).await;
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
