//! Device-to-broker pump
//!
//! Repeatedly reads the selected device and publishes every non-empty read
//! until cancelled.

use crate::core::orchestrator::Orchestrator;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one pump iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpStep {
    /// No device loaded
    NoDevice,
    /// Read failed; carries the snapshot error
    ReadFailed(String),
    /// Read returned nothing
    Empty,
    /// Payload of this many bytes published
    Published(usize),
    /// Publish failed; carries the broker error
    PublishFailed(String),
}

/// Pump counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Iterations run
    pub iterations: u64,
    /// Empty reads
    pub empty_reads: u64,
    /// Payloads published
    pub published: u64,
    /// Bytes published
    pub bytes_published: u64,
    /// Failed reads
    pub read_errors: u64,
    /// Failed publishes
    pub publish_errors: u64,
}

/// Periodic read → publish loop
pub struct BridgePump {
    orchestrator: Orchestrator,
    interval: Duration,
    cancel: CancellationToken,
    stats: Arc<RwLock<PumpStats>>,
}

impl BridgePump {
    /// Create a pump over an orchestrator whose devices are already loaded
    pub fn new(orchestrator: Orchestrator, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
            cancel: CancellationToken::new(),
            stats: Arc::new(RwLock::new(PumpStats::default())),
        }
    }

    /// Token that stops [`run`](Self::run) when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the pump
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Current counters
    pub fn stats(&self) -> PumpStats {
        *self.stats.read()
    }

    /// Run until cancelled
    pub async fn run(&self) -> PumpStats {
        info!(interval_ms = self.interval.as_millis() as u64, "bridge pump started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("bridge pump cancelled");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.step().await;
        }
        self.stats()
    }

    /// Run one read → publish iteration
    ///
    /// Successful operations clear their error field in the snapshot, so the
    /// error fields tell each outcome apart.
    pub async fn step(&self) -> PumpStep {
        let state = self.orchestrator.read_from_device().await;

        let step = if state.devices.is_empty() {
            PumpStep::NoDevice
        } else if let Some(error) = &state.last_error {
            PumpStep::ReadFailed(error.clone())
        } else {
            match state.last_bytes_read.as_ref().map(|p| p.len) {
                None | Some(0) => PumpStep::Empty,
                Some(len) => {
                    let after = self.orchestrator.publish_last_read_to_broker().await;
                    match &after.broker_last_error {
                        None => PumpStep::Published(len),
                        Some(error) => PumpStep::PublishFailed(error.clone()),
                    }
                }
            }
        };

        let mut stats = self.stats.write();
        stats.iterations += 1;
        match &step {
            PumpStep::NoDevice => debug!("no device to pump"),
            PumpStep::ReadFailed(error) => {
                stats.read_errors += 1;
                warn!(%error, "pump read failed");
            }
            PumpStep::Empty => stats.empty_reads += 1,
            PumpStep::Published(len) => {
                stats.published += 1;
                stats.bytes_published += *len as u64;
                debug!(bytes = len, "pumped payload to broker");
            }
            PumpStep::PublishFailed(error) => {
                stats.publish_errors += 1;
                warn!(%error, "pump publish failed");
            }
        }
        step
    }
}
