//! Polling loop: gives every registered connection a chance to produce data.
//!
//! Each sweep reads once from every connection in a registry snapshot:
//!
//! | Read outcome | Action |
//! |---|---|
//! | `Datum` | publish on `…/devices/{identity}/data` |
//! | `Idle` | nothing |
//! | `Transient` | log, keep the connection, retry next sweep |
//! | `Fatal` | log, evict from the registry, close |
//!
//! A single connection's failure never ends the loop; only the shutdown
//! signal does, and it is checked between sweeps.

use std::sync::Arc;
use std::time::Duration;

use commutator_hal::{ConnectionRegistry, ReadOutcome};
use commutator_types::DeviceDatum;
use commutator_middleware::Publisher;
use tracing::{debug, error, info, warn};

use crate::shutdown::ShutdownSignal;

/// Pause between sweeps.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Counters for one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub published: usize,
    pub idle: usize,
    pub transient: usize,
    pub evicted: usize,
    pub publish_failures: usize,
}

pub struct Poller {
    registry: Arc<ConnectionRegistry>,
    publisher: Publisher,
    interval: Duration,
}

impl Poller {
    pub fn new(registry: Arc<ConnectionRegistry>, publisher: Publisher, interval: Duration) -> Self {
        Self {
            registry,
            publisher,
            interval,
        }
    }

    /// Read once from every connection registered at the start of the sweep.
    pub async fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();

        for connection in self.registry.all() {
            let Some(identity) = connection.identity().cloned() else {
                continue;
            };

            match connection.read().await {
                ReadOutcome::Datum(payload) => {
                    debug!(identity = %identity, bytes = payload.len(), "frame received");
                    let datum = DeviceDatum { identity, payload };
                    match self.publisher.publish_datum(&datum).await {
                        Ok(()) => stats.published += 1,
                        Err(e) => {
                            error!(identity = %datum.identity, error = %e, "failed to publish device data");
                            stats.publish_failures += 1;
                        }
                    }
                }
                ReadOutcome::Idle => stats.idle += 1,
                ReadOutcome::Transient(e) => {
                    warn!(identity = %identity, port = %connection.port(), error = %e, "read failed; retrying next sweep");
                    stats.transient += 1;
                }
                ReadOutcome::Fatal(e) => {
                    error!(identity = %identity, port = %connection.port(), error = %e, "connection lost; evicting");
                    self.registry.remove(&connection);
                    connection.close().await;
                    stats.evicted += 1;
                }
            }
        }
        stats
    }

    /// Sweep until `shutdown` is triggered.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        info!(interval_ms = self.interval.as_millis() as u64, "polling loop started");
        while !shutdown.is_triggered() {
            self.sweep().await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.wait() => break,
            }
        }
        info!("polling loop stopped");
    }
}
