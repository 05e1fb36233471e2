// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background poll loop for cookie-based feeds.
//!
//! Cookie feeds have no external scheduler driving them; each configured
//! source gets one dedicated loop that establishes the baseline cookie once
//! at startup, then sleeps a fixed interval and calls
//! [`ReplicationEngine::run`] until stopped.
//!
//! # Stopping
//!
//! [`stop`](PollLoop::stop) is advisory and cooperative: it sets a flag that
//! the loop observes after its sleep, before the next pull. An in-flight
//! pull is never preempted. Run errors are caught and logged without
//! stopping the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::ReplicationEngine;
use crate::error::Result;

/// Dedicated background driver for one engine.
pub struct PollLoop {
    source: String,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PollLoop {
    /// Establish the feed baseline, then spawn the loop.
    ///
    /// Fails (and spawns nothing) if the baseline cannot be established —
    /// without it, the first incremental pull would have nothing to resume
    /// from.
    pub async fn spawn(engine: Arc<ReplicationEngine>, interval: Duration) -> Result<Self> {
        engine.establish_baseline().await?;

        let source = engine.source_name().to_string();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task_source = source.clone();
        let handle = tokio::spawn(async move {
            info!(source = %task_source, interval_ms = interval.as_millis() as u64, "Poll loop started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        // The stop flag is observed after the sleep, before
                        // the next pull.
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        crate::metrics::record_poll_tick(&task_source);
                        match engine.run().await {
                            Ok(result) => {
                                debug!(source = %task_source, %result, "Poll run complete");
                            }
                            Err(e) => {
                                warn!(source = %task_source, error = %e, "Poll run failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(source = %task_source, "Poll loop stopped");
        });

        Ok(Self {
            source,
            shutdown_tx,
            handle,
        })
    }

    /// Name of the source this loop drives.
    pub fn source_name(&self) -> &str {
        &self.source
    }

    /// Signal the loop to stop after any in-flight pull completes.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether the loop task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.handle.await {
            warn!(source = %self.source, error = %e, "Poll loop task panicked");
        }
    }
}
