//! `commutator-hal` – device links and the connection registry.
//!
//! # Modules
//!
//! - [`transport`] – the [`Readable`] / [`Writable`] capability traits, the
//!   tagged [`ReadOutcome`], and the [`TransportOpener`] used by discovery.
//! - [`framing`] – newline framing shared by byte-stream links.
//! - [`serial`] – [`SerialOpener`], the `serialport`-backed link.
//! - [`sim`] – in-memory links for tests and CI.
//! - [`connection`] – [`Connection`], one open link and its lifecycle.
//! - [`registry`] – [`ConnectionRegistry`], the dual port/identity index.
//! - [`discovery`] – the adapter that turns discovery results into
//!   registered connections.

pub mod connection;
pub mod discovery;
pub mod framing;
pub mod registry;
pub mod serial;
pub mod sim;
pub mod transport;

pub use connection::{Connection, ConnectionState};
pub use discovery::{DeviceDiscovery, DeviceKind, DiscoveredDevice, DiscoveryReport, StaticDiscovery, populate};
pub use registry::ConnectionRegistry;
pub use serial::SerialOpener;
pub use transport::{LinkSettings, ReadOutcome, Readable, TransportOpener, TransportPair, Writable};
