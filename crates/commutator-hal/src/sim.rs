//! In-process simulated device links for tests and hardware-less runs.
//!
//! A [`SimDevice`] stands in for one piece of firmware: queue frames (or
//! failures) for the bridge to read, inspect the frames the bridge wrote,
//! and make writes fail or stall on demand.  [`SimOpener`] hands out links to
//! registered devices by port name, so the discovery adapter can be
//! exercised exactly as it is against real serial ports.
//!
//! # Example
//!
//! ```rust
//! use commutator_hal::sim::{SimDevice, SimOpener};
//!
//! let sensor = SimDevice::new();
//! sensor.push_frame(b"23.5");
//!
//! let opener = SimOpener::builder()
//!     .with_device("/dev/ttyUSB0", sensor.clone())
//!     .with_failing_port("/dev/ttyUSB9")
//!     .build();
//! assert_eq!(opener.open_count("/dev/ttyUSB0"), 0);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use commutator_types::CommutatorError;

use crate::transport::{LinkSettings, ReadOutcome, Readable, TransportOpener, TransportPair, Writable};

// ─────────────────────────────────────────────────────────────────────────────
// Simulated device
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SimState {
    inbound: VecDeque<ReadOutcome>,
    written: Vec<Vec<u8>>,
    fail_writes: bool,
    write_delay: Option<Duration>,
    reads: usize,
    closed: bool,
}

/// Shared handle to one simulated device.  Clones observe the same state.
#[derive(Clone, Default)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame to be returned by a future read.
    pub fn push_frame(&self, frame: &[u8]) {
        self.state().inbound.push_back(ReadOutcome::Datum(frame.to_vec()));
    }

    /// Queue an arbitrary read outcome (e.g. a transient or fatal error).
    pub fn push_outcome(&self, outcome: ReadOutcome) {
        self.state().inbound.push_back(outcome);
    }

    /// Every frame written by the bridge, in order, without framing bytes.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    /// Make subsequent writes fail (`true`) or succeed (`false`).
    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Delay every subsequent write by `delay` before it completes.
    pub fn stall_writes(&self, delay: Duration) {
        self.state().write_delay = Some(delay);
    }

    /// Number of read attempts made against this device.
    pub fn reads(&self) -> usize {
        self.state().reads
    }

    /// Whether either half of the link has been closed.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

struct SimReader {
    port: String,
    device: SimDevice,
}

#[async_trait]
impl Readable for SimReader {
    async fn read_frame(&mut self) -> ReadOutcome {
        let mut state = self.device.state();
        state.reads += 1;
        if state.closed {
            return ReadOutcome::Fatal(CommutatorError::Disconnected {
                port: self.port.clone(),
                details: "transport closed".to_string(),
            });
        }
        state.inbound.pop_front().unwrap_or(ReadOutcome::Idle)
    }

    fn close(&mut self) {
        self.device.state().closed = true;
    }
}

struct SimWriter {
    port: String,
    device: SimDevice,
}

#[async_trait]
impl Writable for SimWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), CommutatorError> {
        let delay = self.device.state().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.device.state();
        if state.closed {
            return Err(CommutatorError::Disconnected {
                port: self.port.clone(),
                details: "transport closed".to_string(),
            });
        }
        if state.fail_writes {
            return Err(CommutatorError::Transport {
                port: self.port.clone(),
                details: "simulated write failure".to_string(),
            });
        }
        state.written.push(frame.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.device.state().closed = true;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Opener
// ─────────────────────────────────────────────────────────────────────────────

/// A [`TransportOpener`] that serves [`SimDevice`]s by port name.
///
/// Ports that were never registered, or were registered as failing, report
/// [`CommutatorError::TransportOpen`].
pub struct SimOpener {
    devices: HashMap<String, SimDevice>,
    failing: HashSet<String>,
    opens: Mutex<HashMap<String, usize>>,
    settings: Mutex<HashMap<String, LinkSettings>>,
}

impl SimOpener {
    pub fn builder() -> SimOpenerBuilder {
        SimOpenerBuilder::default()
    }

    /// How many times `port` has been successfully opened.
    pub fn open_count(&self, port: &str) -> usize {
        self.opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(port)
            .copied()
            .unwrap_or(0)
    }

    /// Link settings of the most recent successful open of `port`.
    pub fn last_settings(&self, port: &str) -> Option<LinkSettings> {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(port)
            .copied()
    }
}

impl TransportOpener for SimOpener {
    fn open(&self, port: &str, settings: &LinkSettings) -> Result<TransportPair, CommutatorError> {
        if self.failing.contains(port) {
            return Err(CommutatorError::TransportOpen {
                port: port.to_string(),
                details: "simulated open failure".to_string(),
            });
        }
        let device = self
            .devices
            .get(port)
            .cloned()
            .ok_or_else(|| CommutatorError::TransportOpen {
                port: port.to_string(),
                details: "no such device".to_string(),
            })?;

        *self
            .opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(port.to_string())
            .or_insert(0) += 1;
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port.to_string(), *settings);

        Ok(TransportPair {
            reader: Box::new(SimReader {
                port: port.to_string(),
                device: device.clone(),
            }),
            writer: Box::new(SimWriter {
                port: port.to_string(),
                device,
            }),
        })
    }
}

/// Builder for [`SimOpener`].
#[derive(Default)]
pub struct SimOpenerBuilder {
    devices: HashMap<String, SimDevice>,
    failing: HashSet<String>,
}

impl SimOpenerBuilder {
    /// Serve `device` on `port`.
    pub fn with_device(mut self, port: impl Into<String>, device: SimDevice) -> Self {
        self.devices.insert(port.into(), device);
        self
    }

    /// Make every open of `port` fail.
    pub fn with_failing_port(mut self, port: impl Into<String>) -> Self {
        self.failing.insert(port.into());
        self
    }

    pub fn build(self) -> SimOpener {
        SimOpener {
            devices: self.devices,
            failing: self.failing,
            opens: Mutex::new(HashMap::new()),
            settings: Mutex::new(HashMap::new()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
