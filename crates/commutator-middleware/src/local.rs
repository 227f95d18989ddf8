//! In-process broker.
//!
//! [`LocalBroker`] implements [`BrokerClient`] without a network.  Published
//! messages are kept in a bounded in-memory history (oldest dropped first)
//! and fanned out over a
//! [`tokio::sync::broadcast`] channel so any number of observers can watch
//! outbound traffic.  Inbound traffic is injected with
//! [`inject`][LocalBroker::inject] and delivered onto the inbound queue only
//! if a subscription matches, exactly as a real broker would route it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use commutator_types::CommutatorError;
use tokio::sync::broadcast;
use tracing::debug;

use crate::broker::{BrokerClient, BrokerMessage, InboundSender};
use crate::topics::topic_matches;

/// Buffered outbound messages before slow watchers start lagging.
const DEFAULT_CAPACITY: usize = 256;
/// Published messages retained for [`LocalBroker::published`].
pub const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// Broker living entirely inside the process.
pub struct LocalBroker {
    outbound: broadcast::Sender<BrokerMessage>,
    history: Mutex<VecDeque<BrokerMessage>>,
    history_limit: usize,
    subscriptions: Mutex<Vec<String>>,
    inbound: Mutex<Option<InboundSender>>,
    fail_publishes: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalBroker {
    /// Create a broker that delivers matching inbound messages to `inbound`.
    pub fn new(inbound: InboundSender) -> Self {
        let (outbound, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self {
            outbound,
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            subscriptions: Mutex::new(Vec::new()),
            inbound: Mutex::new(Some(inbound)),
            fail_publishes: AtomicBool::new(false),
        }
    }

    /// Keep at most `limit` published messages (at least one).
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Route a message as if a remote client had published it.
    ///
    /// Returns `Ok(false)` when no subscription matches `topic` (the message
    /// is discarded, as a broker would).  Waits for queue space when the
    /// inbound queue is full.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<bool, CommutatorError> {
        let subscribed = lock(&self.subscriptions).iter().any(|f| topic_matches(f, topic));
        if !subscribed {
            debug!(topic, "no subscription matches injected message");
            return Ok(false);
        }

        let sender = lock(&self.inbound).clone();
        let Some(sender) = sender else {
            return Err(CommutatorError::Broker("local broker is disconnected".to_string()));
        };
        sender
            .send(BrokerMessage::new(topic, payload))
            .await
            .map_err(|_| CommutatorError::Broker("inbound queue closed".to_string()))?;
        Ok(true)
    }

    /// Observe every message published from now on.
    pub fn watch(&self) -> broadcast::Receiver<BrokerMessage> {
        self.outbound.subscribe()
    }

    /// The most recent published messages, oldest first.
    pub fn published(&self) -> Vec<BrokerMessage> {
        lock(&self.history).iter().cloned().collect()
    }

    /// Payloads published on exactly `topic`, in order.
    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        lock(&self.history)
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    /// Make subsequent publishes fail (`true`) or succeed (`false`).
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inbound).is_some()
    }
}

#[async_trait]
impl BrokerClient for LocalBroker {
    async fn subscribe(&self, filter: &str) -> Result<(), CommutatorError> {
        if !self.is_connected() {
            return Err(CommutatorError::Broker("local broker is disconnected".to_string()));
        }
        let mut subscriptions = lock(&self.subscriptions);
        if !subscriptions.iter().any(|f| f == filter) {
            subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), CommutatorError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(CommutatorError::Broker(format!("publish to '{topic}' rejected")));
        }
        if !self.is_connected() {
            return Err(CommutatorError::Broker("local broker is disconnected".to_string()));
        }

        let message = BrokerMessage::new(topic, payload);
        {
            let mut history = lock(&self.history);
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(message.clone());
        }
        // No watchers is normal.
        let _ = self.outbound.send(message);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CommutatorError> {
        if lock(&self.inbound).take().is_some() {
            debug!("local broker disconnected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::inbound_queue;

    #[tokio::test]
    async fn inject_routes_only_subscribed_topics() {
        let (tx, mut rx) = inbound_queue(8);
        let broker = LocalBroker::new(tx);
        broker.subscribe("b/devices/+/command").await.unwrap();

        assert!(broker.inject("b/devices/x/command", "{}").await.unwrap());
        assert!(!broker.inject("b/other", "{}").await.unwrap());

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "b/devices/x/command");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_is_recorded_and_broadcast() {
        let (tx, _rx) = inbound_queue(8);
        let broker = LocalBroker::new(tx);
        let mut watcher = broker.watch();

        broker.publish("t/1", b"23.5".to_vec()).await.unwrap();

        assert_eq!(watcher.recv().await.unwrap(), BrokerMessage::new("t/1", "23.5"));
        assert_eq!(broker.published_to("t/1"), vec![b"23.5".to_vec()]);
        assert!(broker.published_to("t/2").is_empty());
    }

    #[tokio::test]
    async fn failing_publish_is_not_recorded() {
        let (tx, _rx) = inbound_queue(8);
        let broker = LocalBroker::new(tx);
        broker.fail_publishes(true);

        let err = broker.publish("t", vec![1]).await.unwrap_err();
        assert!(matches!(err, CommutatorError::Broker(_)));
        assert!(broker.published().is_empty());

        broker.fail_publishes(false);
        broker.publish("t", vec![1]).await.unwrap();
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_closes_inbound_queue() {
        let (tx, mut rx) = inbound_queue(8);
        let broker = LocalBroker::new(tx);
        broker.subscribe("#").await.unwrap();

        broker.disconnect().await.unwrap();

        assert!(!broker.is_connected());
        assert!(rx.recv().await.is_none());
        assert!(broker.inject("a", "x").await.is_err());
        assert!(broker.publish("a", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_subscriptions_are_collapsed() {
        let (tx, _rx) = inbound_queue(8);
        let broker = LocalBroker::new(tx);
        broker.subscribe("a/+").await.unwrap();
        broker.subscribe("a/+").await.unwrap();
        assert_eq!(broker.subscriptions(), vec!["a/+".to_string()]);
    }

    #[tokio::test]
    async fn history_keeps_only_the_most_recent_messages() {
        let (tx, _rx) = inbound_queue(8);
        let broker = LocalBroker::new(tx).with_history_limit(2);

        for payload in ["1", "2", "3"] {
            broker.publish("t", payload.as_bytes().to_vec()).await.unwrap();
        }

        assert_eq!(broker.published_to("t"), vec![b"2".to_vec(), b"3".to_vec()]);
    }
}
