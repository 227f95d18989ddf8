//! Command dispatcher: one inbound broker message in, at most one device
//! write and one status report out.
//!
//! Messages that cannot be parsed or do not resolve to a registered device
//! are logged and dropped without touching any transport or publishing
//! anything.  Everything else is written to the device (bounded by the
//! write timeout) and acknowledged on `…/devices/{identity}/status` with
//! `delivered` or `failed`.  A failed write does not close the connection.

use std::sync::Arc;
use std::time::Duration;

use commutator_hal::{Connection, ConnectionRegistry};
use commutator_middleware::{Addressing, BrokerMessage, InboundReceiver, Publisher};
use commutator_types::{CommutatorError, DeliveryStatus, DeviceId, InboundCommand, StatusReport};
use serde_json::Value;
use tracing::{error, info, warn};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// What became of one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered(DeviceId),
    Failed(DeviceId),
    /// Not dispatched; nothing was written or published.
    Dropped(CommutatorError),
}

struct Resolved {
    body: Value,
    identity: DeviceId,
    connection: Arc<Connection>,
    frame: Vec<u8>,
}

pub struct CommandDispatcher {
    registry: Arc<ConnectionRegistry>,
    publisher: Publisher,
    addressing: Addressing,
    write_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        publisher: Publisher,
        addressing: Addressing,
        write_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            publisher,
            addressing,
            write_timeout,
        }
    }

    /// Handle a single inbound message.
    pub async fn handle(&self, message: &BrokerMessage) -> DispatchOutcome {
        let resolved = match self.resolve(message) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "dropping command");
                return DispatchOutcome::Dropped(e);
            }
        };

        let status = self.deliver(&resolved).await;
        let report = StatusReport::now(resolved.body, status);
        if let Err(e) = self.publisher.publish_status(&resolved.identity, &report).await {
            error!(identity = %resolved.identity, error = %e, "failed to publish command status");
        }

        match status {
            DeliveryStatus::Delivered => DispatchOutcome::Delivered(resolved.identity),
            DeliveryStatus::Failed => DispatchOutcome::Failed(resolved.identity),
        }
    }

    /// Drain `inbound` in arrival order until every sender is gone.
    pub async fn run(&self, mut inbound: InboundReceiver) {
        info!(addressing = %self.addressing, "dispatch loop started");
        while let Some(message) = inbound.recv().await {
            self.handle(&message).await;
        }
        info!("dispatch loop stopped");
    }

    fn resolve(&self, message: &BrokerMessage) -> Result<Resolved, CommutatorError> {
        let body: Value =
            serde_json::from_slice(&message.payload).map_err(|e| CommutatorError::Parse(e.to_string()))?;
        let command = InboundCommand::from_json(&body)?;

        let identity = match self.addressing {
            Addressing::Body => command
                .uuid
                .as_deref()
                .filter(|uuid| !uuid.is_empty())
                .map(DeviceId::from)
                .ok_or_else(|| CommutatorError::UnknownDevice("command carries no uuid".to_string()))?,
            Addressing::Topic | Addressing::LegacyValve => self
                .publisher
                .topics()
                .identity_from_topic(&message.topic, self.addressing)
                .ok_or_else(|| {
                    CommutatorError::UnknownDevice(format!("no device identity in topic '{}'", message.topic))
                })?,
        };

        let connection = self
            .registry
            .lookup_by_identity(identity.as_str())
            .ok_or_else(|| CommutatorError::UnknownDevice(identity.to_string()))?;
        let frame = command.to_device_command(&identity, connection.default_pin()).to_frame()?;

        Ok(Resolved {
            body,
            identity,
            connection,
            frame,
        })
    }

    async fn deliver(&self, resolved: &Resolved) -> DeliveryStatus {
        let identity = &resolved.identity;
        match tokio::time::timeout(self.write_timeout, resolved.connection.write(&resolved.frame)).await {
            Ok(Ok(())) => {
                info!(identity = %identity, port = %resolved.connection.port(), "command delivered");
                DeliveryStatus::Delivered
            }
            Ok(Err(e)) => {
                warn!(identity = %identity, error = %e, "command write failed");
                DeliveryStatus::Failed
            }
            Err(_) => {
                warn!(
                    identity = %identity,
                    timeout_ms = self.write_timeout.as_millis() as u64,
                    "command write timed out"
                );
                DeliveryStatus::Failed
            }
        }
    }
}
