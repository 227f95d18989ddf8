//! Transport capability traits.
//!
//! The rest of the bridge never asks *what kind* of link a device hangs off.
//! The polling loop only needs something [`Readable`], the dispatcher only
//! needs something [`Writable`], and discovery only needs a
//! [`TransportOpener`] that can turn a port name into one of each.  Serial
//! ports ([`crate::serial`]) and in-memory links ([`crate::sim`]) both
//! satisfy these traits, so a new link type never touches routing code.

use std::time::Duration;

use async_trait::async_trait;
use commutator_types::CommutatorError;

/// Default line speed for device links.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default time a single read may block waiting for bytes.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Result of one read attempt, tagged by what the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete frame arrived.
    Datum(Vec<u8>),
    /// Nothing to read right now.
    Idle,
    /// The read failed but the link is expected to recover; retry next sweep.
    Transient(CommutatorError),
    /// The link is gone; the connection should be evicted.
    Fatal(CommutatorError),
}

/// The receiving half of a device link.
#[async_trait]
pub trait Readable: Send {
    /// Attempt to read one frame, waiting at most the link's read timeout.
    async fn read_frame(&mut self) -> ReadOutcome;

    /// Release the underlying resource.  Reads after `close` report
    /// [`ReadOutcome::Fatal`].
    fn close(&mut self) {}
}

/// The sending half of a device link.
#[async_trait]
pub trait Writable: Send {
    /// Write one frame.  Framing bytes are added by the implementation.
    ///
    /// # Errors
    ///
    /// Returns [`CommutatorError::Transport`] or
    /// [`CommutatorError::Disconnected`] when the bytes could not be written.
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), CommutatorError>;

    /// Release the underlying resource.
    fn close(&mut self) {}
}

/// A freshly opened link, split so that reads and writes never contend.
pub struct TransportPair {
    pub reader: Box<dyn Readable>,
    pub writer: Box<dyn Writable>,
}

/// Fixed per-link configuration applied when a port is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Opens a link on a named port.
pub trait TransportOpener: Send + Sync {
    /// # Errors
    ///
    /// Returns [`CommutatorError::TransportOpen`] when the port does not
    /// exist, is busy, or rejects the requested settings.
    fn open(&self, port: &str, settings: &LinkSettings) -> Result<TransportPair, CommutatorError>;
}
