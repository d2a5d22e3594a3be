//! Periodic scanning on a tokio interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::Scanner;
use crate::deployment::DeploymentUnit;

/// Background task calling [`Scanner::scan`] every `interval` and forwarding
/// non-empty batches of new units.
///
/// Only one scan is in flight at a time: the next tick is not taken until the
/// previous scan returned.
pub struct ScanPoller {
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ScanPoller {
    /// Start polling. Must be called inside a tokio runtime.
    pub fn spawn(
        scanner: Arc<dyn Scanner>,
        interval: Duration,
    ) -> (Self, mpsc::Receiver<Vec<DeploymentUnit>>) {
        let (units_tx, units_rx) = mpsc::channel(64);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        info!(?interval, "starting scan poller");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let scanner = Arc::clone(&scanner);
                        let result = match tokio::task::spawn_blocking(move || scanner.scan()).await {
                            Ok(result) => result,
                            Err(e) => {
                                error!(error = %e, "scan task panicked");
                                continue;
                            }
                        };

                        match result {
                            Ok(units) if units.is_empty() => {}
                            Ok(units) => {
                                debug!(count = units.len(), "forwarding new deployment units");
                                if units_tx.send(units).await.is_err() {
                                    debug!("scan receiver dropped, stopping poller");
                                    return;
                                }
                            }
                            Err(e) => warn!(error = %e, "scheduled scan failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("scan poller shutting down");
                        return;
                    }
                }
            }
        });

        (
            Self {
                shutdown_tx: Some(shutdown_tx),
                handle: Some(handle),
            },
            units_rx,
        )
    }

    /// Stop polling and wait for the task to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "scan poller task ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ScanPoller {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
