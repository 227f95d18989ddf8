//! The broker capability.
//!
//! The bridge never talks to a concrete broker library.  It publishes
//! through [`BrokerClient`] and receives commands from a bounded inbound
//! queue that the client feeds from its own network activity.  The queue
//! decouples broker latency from device write latency: a slow serial write
//! never stalls the client's keep-alive handling.
//!
//! Two implementations ship with the crate:
//!
//! - [`MqttBroker`][crate::mqtt::MqttBroker] – a real MQTT connection.
//! - [`LocalBroker`][crate::local::LocalBroker] – an in-process broker for
//!   tests and embedding.

use async_trait::async_trait;
use commutator_types::CommutatorError;
use tokio::sync::mpsc;

/// Inbound queue depth used when the configuration does not set one.
pub const DEFAULT_INBOUND_CAPACITY: usize = 64;

/// A message as seen on the broker: topic plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

pub type InboundSender = mpsc::Sender<BrokerMessage>;
pub type InboundReceiver = mpsc::Receiver<BrokerMessage>;

/// Create the bounded queue a broker client feeds and the dispatcher drains.
pub fn inbound_queue(capacity: usize) -> (InboundSender, InboundReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Connect/subscribe/publish primitives the bridge needs from a broker.
///
/// Messages matching a subscription are pushed onto the inbound queue the
/// client was constructed with.  After [`disconnect`][Self::disconnect] the
/// client drops its end of that queue, so the consumer observes the queue
/// closing.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Start receiving messages whose topic matches `filter` (`+` and `#`
    /// wildcards allowed).
    async fn subscribe(&self, filter: &str) -> Result<(), CommutatorError>;

    /// Publish `payload` on `topic`.  No retry and no buffering: a failure
    /// is returned to the caller and the payload is lost.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), CommutatorError>;

    /// Stop delivering inbound messages and close the connection.
    async fn disconnect(&self) -> Result<(), CommutatorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inbound_queue_is_bounded() {
        let (tx, mut rx) = inbound_queue(1);
        tx.try_send(BrokerMessage::new("a", "1")).unwrap();
        assert!(tx.try_send(BrokerMessage::new("b", "2")).is_err());
        assert_eq!(rx.recv().await.unwrap().topic, "a");
    }

    #[test]
    fn zero_capacity_is_clamped() {
        // mpsc::channel panics on zero; the helper must not.
        let (tx, _rx) = inbound_queue(0);
        assert!(tx.try_send(BrokerMessage::new("a", "")).is_ok());
    }
}
