//! [`Connection`] – one open device link and its lifecycle.
//!
//! ```text
//! Unbound ──bind()──▶ Bound ──close()──▶ Closed
//! ```
//!
//! A connection is created `Unbound` when discovery opens a port, becomes
//! `Bound` once it is given its device identity, and ends `Closed` on
//! shutdown or after an unrecoverable transport failure.  There is no way
//! back: a closed connection is dropped from the registry and a later
//! discovery has to open a fresh one.
//!
//! Reads and writes go through separate locks.  The polling loop is the only
//! reader and the dispatcher the only writer, so neither lock is ever
//! contended in steady state.

use std::fmt;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use commutator_types::{CommutatorError, DeviceId};
use tokio::sync::Mutex as AsyncMutex;

use crate::transport::{ReadOutcome, Readable, TransportPair, Writable};

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unbound,
    Bound,
    Closed,
}

#[derive(Debug)]
struct Binding {
    identity: DeviceId,
    default_pin: Option<i64>,
}

/// An open device link, indexed in the registry by port and by identity.
pub struct Connection {
    port: String,
    binding: OnceLock<Binding>,
    state: Mutex<ConnectionState>,
    reader: AsyncMutex<Box<dyn Readable>>,
    writer: AsyncMutex<Box<dyn Writable>>,
}

impl Connection {
    /// Wrap a freshly opened link on `port`.  The connection starts
    /// [`ConnectionState::Unbound`].
    pub fn new(port: impl Into<String>, transport: TransportPair) -> Self {
        Self {
            port: port.into(),
            binding: OnceLock::new(),
            state: Mutex::new(ConnectionState::Unbound),
            reader: AsyncMutex::new(transport.reader),
            writer: AsyncMutex::new(transport.writer),
        }
    }

    /// Open-and-bind in one step.
    pub fn bound(
        port: impl Into<String>,
        transport: TransportPair,
        identity: DeviceId,
        default_pin: Option<i64>,
    ) -> Result<Self, CommutatorError> {
        let connection = Self::new(port, transport);
        connection.bind(identity, default_pin)?;
        Ok(connection)
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// The bound device identity, if any.
    pub fn identity(&self) -> Option<&DeviceId> {
        self.binding.get().map(|b| &b.identity)
    }

    /// Valve pin configured for the bound device, used when a command
    /// does not name one.
    pub fn default_pin(&self) -> Option<i64> {
        self.binding.get().and_then(|b| b.default_pin)
    }

    pub fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    /// `true` while the connection is bound and not yet closed.
    pub fn is_live(&self) -> bool {
        self.state() == ConnectionState::Bound
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the device identity.  Only valid from
    /// [`ConnectionState::Unbound`].
    ///
    /// # Errors
    ///
    /// Returns [`CommutatorError::IdentityInUse`] if the connection is
    /// already bound and [`CommutatorError::Disconnected`] if it is closed.
    pub fn bind(&self, identity: DeviceId, default_pin: Option<i64>) -> Result<(), CommutatorError> {
        let mut state = self.lock_state();
        match *state {
            ConnectionState::Unbound => {
                self.binding
                    .set(Binding {
                        identity,
                        default_pin,
                    })
                    .map_err(|rejected| CommutatorError::IdentityInUse(rejected.identity))?;
                *state = ConnectionState::Bound;
                Ok(())
            }
            ConnectionState::Bound => Err(CommutatorError::IdentityInUse(
                self.identity().cloned().unwrap_or(identity),
            )),
            ConnectionState::Closed => Err(CommutatorError::Disconnected {
                port: self.port.clone(),
                details: "cannot bind a closed connection".to_string(),
            }),
        }
    }

    /// Read one frame from the device.
    pub async fn read(&self) -> ReadOutcome {
        if self.state() == ConnectionState::Closed {
            return ReadOutcome::Fatal(self.closed_error());
        }
        self.reader.lock().await.read_frame().await
    }

    /// Write one frame to the device.
    pub async fn write(&self, frame: &[u8]) -> Result<(), CommutatorError> {
        if self.state() == ConnectionState::Closed {
            return Err(self.closed_error());
        }
        self.writer.lock().await.write_frame(frame).await
    }

    /// Close both halves of the link.  Idempotent.
    ///
    /// Waits for an in-flight read or write to finish before releasing the
    /// transport.
    pub async fn close(&self) {
        {
            let mut state = self.lock_state();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        self.reader.lock().await.close();
        self.writer.lock().await.close();
    }

    fn closed_error(&self) -> CommutatorError {
        CommutatorError::Disconnected {
            port: self.port.clone(),
            details: "connection closed".to_string(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("port", &self.port)
            .field("identity", &self.identity())
            .field("state", &self.state())
            .finish()
    }
}
