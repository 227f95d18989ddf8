//! Outbound side of the bridge.
//!
//! Device data is forwarded byte-for-byte; command outcomes are serialized
//! as JSON [`StatusReport`]s.  Nothing is retried or buffered here: a failed
//! publish is returned to the caller, which logs it and moves on.

use std::sync::Arc;

use commutator_types::{CommutatorError, DeviceDatum, DeviceId, StatusReport};
use tracing::trace;

use crate::broker::BrokerClient;
use crate::topics::TopicScheme;

/// Publishes device data and command status through a [`BrokerClient`].
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn BrokerClient>,
    topics: TopicScheme,
}

impl Publisher {
    pub fn new(broker: Arc<dyn BrokerClient>, topics: TopicScheme) -> Self {
        Self { broker, topics }
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    /// Forward raw device output on `{base}/devices/{identity}/data`.
    pub async fn publish_data(&self, identity: &DeviceId, data: &[u8]) -> Result<(), CommutatorError> {
        let topic = self.topics.data_topic(identity);
        self.broker.publish(&topic, data.to_vec()).await?;
        trace!(%topic, bytes = data.len(), "data published");
        Ok(())
    }

    pub async fn publish_datum(&self, datum: &DeviceDatum) -> Result<(), CommutatorError> {
        self.publish_data(&datum.identity, &datum.payload).await
    }

    /// Publish a command outcome on `{base}/devices/{identity}/status`.
    pub async fn publish_status(&self, identity: &DeviceId, report: &StatusReport) -> Result<(), CommutatorError> {
        let payload = serde_json::to_vec(report).map_err(|e| CommutatorError::Serialization(e.to_string()))?;
        let topic = self.topics.status_topic(identity);
        self.broker.publish(&topic, payload).await?;
        trace!(%topic, status = %report.status, "status published");
        Ok(())
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").field("topics", &self.topics).finish_non_exhaustive()
    }
}
