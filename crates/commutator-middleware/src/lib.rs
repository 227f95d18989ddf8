//! `commutator-middleware` – everything between the bridge and the broker.
//!
//! # Modules
//!
//! - [`broker`] – the [`BrokerClient`] capability and the bounded inbound
//!   queue.
//! - [`mqtt`] – [`MqttBroker`], the network implementation.
//! - [`local`] – [`LocalBroker`], an in-process implementation.
//! - [`topics`] – topic layout, wildcard matching, and the inbound
//!   [`Addressing`] schemes.
//! - [`publisher`] – [`Publisher`], the outbound data/status path.

pub mod broker;
pub mod local;
pub mod mqtt;
pub mod publisher;
pub mod topics;

pub use broker::{BrokerClient, BrokerMessage, DEFAULT_INBOUND_CAPACITY, InboundReceiver, InboundSender, inbound_queue};
pub use local::LocalBroker;
pub use mqtt::{MqttBroker, MqttSettings};
pub use publisher::Publisher;
pub use topics::{Addressing, TopicScheme, topic_matches};
