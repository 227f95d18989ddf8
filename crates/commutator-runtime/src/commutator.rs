//! [`Commutator`] – wires the registry, polling loop, and dispatcher to a
//! broker.
//!
//! ```text
//! Commutator::new ─▶ discover() ─▶ start() ─▶ RunningCommutator ─▶ shutdown()
//! ```
//!
//! Discovery completes before any task starts, so in steady state the
//! registry only changes when the polling loop evicts a dead connection.
//! Shutdown is cooperative: the polling loop finishes its current sweep
//! (or is aborted if that sweep is stuck on the broker), the broker is
//! disconnected (which closes the inbound queue and lets the
//! dispatcher finish the command it is handling), and then every remaining
//! connection is closed.

use std::sync::Arc;
use std::time::Duration;

use commutator_hal::{ConnectionRegistry, DeviceDiscovery, DiscoveryReport, LinkSettings, TransportOpener, populate};
use commutator_middleware::{Addressing, BrokerClient, InboundReceiver, Publisher, TopicScheme};
use commutator_types::CommutatorError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dispatcher::{CommandDispatcher, DEFAULT_WRITE_TIMEOUT};
use crate::poller::{DEFAULT_POLL_INTERVAL, Poller};
use crate::shutdown::ShutdownSignal;

/// Upper bound on waiting for the polling loop to finish its sweep.
const POLL_STOP_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound on waiting for the dispatch loop after the broker is gone.
const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime settings for a [`Commutator`].
#[derive(Debug, Clone)]
pub struct CommutatorConfig {
    /// Prefix of every topic the bridge publishes or subscribes to.
    pub base_topic: String,
    pub addressing: Addressing,
    pub poll_interval: Duration,
    pub write_timeout: Duration,
    /// Line settings used when discovery opens a port.
    pub link: LinkSettings,
}

impl Default for CommutatorConfig {
    fn default() -> Self {
        Self {
            base_topic: "commutator".to_string(),
            addressing: Addressing::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            link: LinkSettings::default(),
        }
    }
}

/// A configured bridge that has not started yet.
pub struct Commutator {
    config: CommutatorConfig,
    registry: Arc<ConnectionRegistry>,
    broker: Arc<dyn BrokerClient>,
    publisher: Publisher,
}

impl Commutator {
    pub fn new(config: CommutatorConfig, broker: Arc<dyn BrokerClient>) -> Self {
        let publisher = Publisher::new(Arc::clone(&broker), TopicScheme::new(&config.base_topic));
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            broker,
            publisher,
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Open and register every device `discovery` reports.
    pub async fn discover(&self, discovery: &dyn DeviceDiscovery, opener: &dyn TransportOpener) -> DiscoveryReport {
        let report = populate(&self.registry, discovery, opener, &self.config.link).await;
        info!(
            registered = report.registered.len(),
            skipped = report.skipped.len(),
            "discovery complete"
        );
        report
    }

    /// Subscribe to commands and spawn the polling and dispatch loops.
    ///
    /// `inbound` must be the receiving end of the queue the broker client
    /// was constructed with.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the command subscription fails; nothing
    /// has been spawned in that case.
    pub async fn start(self, inbound: InboundReceiver) -> Result<RunningCommutator, CommutatorError> {
        let filter = self.publisher.topics().command_filter(self.config.addressing);
        self.broker.subscribe(&filter).await?;
        info!(%filter, addressing = %self.config.addressing, devices = self.registry.len(), "bridge started");

        let shutdown = ShutdownSignal::new();

        let poller = Poller::new(Arc::clone(&self.registry), self.publisher.clone(), self.config.poll_interval);
        let poller_task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { poller.run(shutdown).await }
        });

        let dispatcher = CommandDispatcher::new(
            Arc::clone(&self.registry),
            self.publisher.clone(),
            self.config.addressing,
            self.config.write_timeout,
        );
        let dispatcher_task = tokio::spawn(async move { dispatcher.run(inbound).await });

        Ok(RunningCommutator {
            shutdown,
            registry: self.registry,
            broker: self.broker,
            poller: poller_task,
            dispatcher: dispatcher_task,
        })
    }
}

/// A started bridge.  Call [`shutdown`][Self::shutdown] to stop it.
pub struct RunningCommutator {
    shutdown: ShutdownSignal,
    registry: Arc<ConnectionRegistry>,
    broker: Arc<dyn BrokerClient>,
    poller: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl RunningCommutator {
    /// The signal that stops the polling loop.  Triggering it alone does not
    /// disconnect the broker; [`shutdown`][Self::shutdown] does both.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Stop polling, disconnect the broker, and close every connection.
    ///
    /// Returns how many connections were closed.
    pub async fn shutdown(self) -> usize {
        info!("shutting down");
        self.shutdown.trigger();
        let mut poller = self.poller;
        match tokio::time::timeout(POLL_STOP_TIMEOUT, &mut poller).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "polling task ended abnormally"),
            Err(_) => {
                warn!("polling loop did not finish its sweep; aborting");
                poller.abort();
            }
        }

        if let Err(e) = self.broker.disconnect().await {
            warn!(error = %e, "broker disconnect failed");
        }

        let mut dispatcher = self.dispatcher;
        match tokio::time::timeout(DISPATCH_DRAIN_TIMEOUT, &mut dispatcher).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "dispatch task ended abnormally"),
            Err(_) => {
                warn!("dispatch loop still running after broker disconnect; aborting");
                dispatcher.abort();
            }
        }

        let closed = self.registry.close_all().await;
        info!(closed, "all connections closed");
        closed
    }
}
