//! `commutator-runtime` – the running bridge.
//!
//! # Modules
//!
//! - [`poller`] – [`Poller`]: sweeps every registered connection and
//!   forwards device output to the broker.
//! - [`dispatcher`] – [`CommandDispatcher`]: turns inbound broker commands
//!   into device writes and status reports.
//! - [`commutator`] – [`Commutator`]: discovery, startup, and cooperative
//!   shutdown of the two loops above.
//! - [`shutdown`] – [`ShutdownSignal`], the shared stop latch.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console
//!   logging plus optional OTLP span export.

pub mod commutator;
pub mod dispatcher;
pub mod poller;
pub mod shutdown;
pub mod telemetry;

pub use commutator::{Commutator, CommutatorConfig, RunningCommutator};
pub use dispatcher::{CommandDispatcher, DispatchOutcome};
pub use poller::{Poller, SweepStats};
pub use shutdown::ShutdownSignal;
pub use telemetry::{TracerProviderGuard, init_tracing};
