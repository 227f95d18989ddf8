//! Serial-port transport backed by the `serialport` crate.
//!
//! [`SerialOpener`] opens a port at 8N1 with no flow control, then clones the
//! OS handle so the reader and writer halves own independent descriptors.
//! All blocking I/O is pushed onto Tokio's blocking pool.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use commutator_types::CommutatorError;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::debug;

use crate::framing::LineFramer;
use crate::transport::{LinkSettings, ReadOutcome, Readable, TransportOpener, TransportPair, Writable};

/// Bytes requested from the OS per read call.
const READ_CHUNK: usize = 512;

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// Opens physical serial ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl TransportOpener for SerialOpener {
    fn open(&self, port: &str, settings: &LinkSettings) -> Result<TransportPair, CommutatorError> {
        let handle = serialport::new(port, settings.baud_rate)
            .timeout(settings.read_timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()
            .map_err(|e| CommutatorError::TransportOpen {
                port: port.to_string(),
                details: e.to_string(),
            })?;
        let writer = handle.try_clone().map_err(|e| CommutatorError::TransportOpen {
            port: port.to_string(),
            details: format!("cannot clone handle for writing: {e}"),
        })?;

        debug!(port, baud_rate = settings.baud_rate, "serial port opened");
        Ok(TransportPair {
            reader: Box::new(SerialReader {
                port: port.to_string(),
                handle: Some(Arc::new(Mutex::new(handle))),
                framer: LineFramer::new(),
            }),
            writer: Box::new(SerialWriter {
                port: port.to_string(),
                handle: Some(Arc::new(Mutex::new(writer))),
            }),
        })
    }
}

struct SerialReader {
    port: String,
    handle: Option<SharedPort>,
    framer: LineFramer,
}

impl SerialReader {
    fn buffered_frame(&mut self) -> Option<ReadOutcome> {
        match self.framer.next_frame() {
            Ok(Some(frame)) => Some(ReadOutcome::Datum(frame)),
            Ok(None) => None,
            Err(overflow) => Some(ReadOutcome::Transient(CommutatorError::Transport {
                port: self.port.clone(),
                details: format!("frame overflow, {} bytes discarded", overflow.discarded),
            })),
        }
    }
}

#[async_trait]
impl Readable for SerialReader {
    async fn read_frame(&mut self) -> ReadOutcome {
        if let Some(outcome) = self.buffered_frame() {
            return outcome;
        }
        let Some(handle) = self.handle.clone() else {
            return ReadOutcome::Fatal(closed(&self.port));
        };

        let result = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK];
            let mut port = handle.lock().unwrap_or_else(PoisonError::into_inner);
            port.read(&mut buf).map(|n| buf[..n].to_vec())
        })
        .await;

        match result {
            Ok(Ok(bytes)) if bytes.is_empty() => ReadOutcome::Idle,
            Ok(Ok(bytes)) => {
                self.framer.push(&bytes);
                self.buffered_frame().unwrap_or(ReadOutcome::Idle)
            }
            Ok(Err(e)) => classify_io_error(&self.port, &e),
            Err(join) => ReadOutcome::Transient(CommutatorError::Transport {
                port: self.port.clone(),
                details: format!("read task failed: {join}"),
            }),
        }
    }

    fn close(&mut self) {
        self.handle = None;
    }
}

struct SerialWriter {
    port: String,
    handle: Option<SharedPort>,
}

#[async_trait]
impl Writable for SerialWriter {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), CommutatorError> {
        let Some(handle) = self.handle.clone() else {
            return Err(closed(&self.port));
        };
        let bytes = LineFramer::encode(frame);

        let result = tokio::task::spawn_blocking(move || {
            let mut port = handle.lock().unwrap_or_else(PoisonError::into_inner);
            port.write_all(&bytes)?;
            port.flush()
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(match classify_io_error(&self.port, &e) {
                ReadOutcome::Fatal(err) => err,
                _ => CommutatorError::Transport {
                    port: self.port.clone(),
                    details: e.to_string(),
                },
            }),
            Err(join) => Err(CommutatorError::Transport {
                port: self.port.clone(),
                details: format!("write task failed: {join}"),
            }),
        }
    }

    fn close(&mut self) {
        self.handle = None;
    }
}

fn closed(port: &str) -> CommutatorError {
    CommutatorError::Disconnected {
        port: port.to_string(),
        details: "transport closed".to_string(),
    }
}

/// Map an I/O error from a serial read onto the polling loop's retry policy.
///
/// Timeouts are the normal "no data yet" path.  Errors that mean the device
/// node has gone away (unplugged adapter, revoked permissions) are fatal;
/// everything else is retried.
pub fn classify_io_error(port: &str, error: &io::Error) -> ReadOutcome {
    // EIO, ENXIO, ENODEV: what Linux reports after a USB adapter is pulled.
    const UNPLUGGED_ERRNOS: [i32; 3] = [5, 6, 19];

    match error.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
            ReadOutcome::Idle
        }
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotFound
        | io::ErrorKind::PermissionDenied
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => ReadOutcome::Fatal(CommutatorError::Disconnected {
            port: port.to_string(),
            details: error.to_string(),
        }),
        _ if cfg!(unix) && error.raw_os_error().is_some_and(|c| UNPLUGGED_ERRNOS.contains(&c)) => {
            ReadOutcome::Fatal(CommutatorError::Disconnected {
                port: port.to_string(),
                details: error.to_string(),
            })
        }
        _ => ReadOutcome::Transient(CommutatorError::Transport {
            port: port.to_string(),
            details: error.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_means_no_data() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "Operation timed out");
        assert_eq!(classify_io_error("/dev/ttyUSB0", &err), ReadOutcome::Idle);
    }

    #[test]
    fn broken_pipe_is_fatal() {
        let err = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(
            classify_io_error("/dev/ttyUSB0", &err),
            ReadOutcome::Fatal(CommutatorError::Disconnected { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn eio_after_unplug_is_fatal() {
        let err = io::Error::from_raw_os_error(5);
        assert!(matches!(
            classify_io_error("/dev/ttyACM0", &err),
            ReadOutcome::Fatal(_)
        ));
    }

    #[test]
    fn other_errors_are_transient() {
        let err = io::Error::new(io::ErrorKind::InvalidData, "framing error");
        match classify_io_error("/dev/ttyUSB0", &err) {
            ReadOutcome::Transient(CommutatorError::Transport { port, .. }) => {
                assert_eq!(port, "/dev/ttyUSB0");
            }
            other => panic!("expected transient, got {other:?}"),
        }
    }

    #[test]
    fn opening_a_missing_port_reports_open_error() {
        let result = SerialOpener.open("/dev/does-not-exist-commutator", &LinkSettings::default());
        assert!(matches!(result, Err(CommutatorError::TransportOpen { .. })));
    }

    /// Connected pseudo-terminal halves: `(bridge side, device side)`.
    #[cfg(unix)]
    fn pty_pair() -> (Box<dyn SerialPort>, Box<dyn SerialPort>) {
        use std::time::Duration;

        let (mut bridge, mut device) = serialport::TTYPort::pair().expect("pseudo-terminal pair");
        bridge.set_timeout(Duration::from_millis(100)).unwrap();
        device.set_timeout(Duration::from_millis(100)).unwrap();
        (Box::new(bridge), Box::new(device))
    }

    #[cfg(unix)]
    fn shared(port: Box<dyn SerialPort>) -> Option<SharedPort> {
        Some(Arc::new(Mutex::new(port)))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn frames_from_one_os_read_are_handed_out_one_at_a_time() {
        let (bridge, mut device) = pty_pair();
        let mut reader = SerialReader {
            port: "pty".to_string(),
            handle: shared(bridge),
            framer: LineFramer::new(),
        };

        device.write_all(b"23.5\n24.0\r\n").unwrap();
        device.flush().unwrap();

        assert_eq!(reader.read_frame().await, ReadOutcome::Datum(b"23.5".to_vec()));
        assert_eq!(reader.read_frame().await, ReadOutcome::Datum(b"24.0".to_vec()));
        assert_eq!(reader.read_frame().await, ReadOutcome::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn written_frames_are_newline_terminated() {
        let (bridge, mut device) = pty_pair();
        let mut writer = SerialWriter {
            port: "pty".to_string(),
            handle: shared(bridge),
        };

        writer.write_frame(br#"{"status":true}"#).await.unwrap();

        let expected = b"{\"status\":true}\n";
        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        while received.len() < expected.len() {
            let n = device.read(&mut buf).expect("frame reaches the device");
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn closed_halves_report_disconnected() {
        let (bridge, _device) = pty_pair();
        let handle = shared(bridge);
        let mut reader = SerialReader {
            port: "pty".to_string(),
            handle: handle.clone(),
            framer: LineFramer::new(),
        };
        let mut writer = SerialWriter {
            port: "pty".to_string(),
            handle,
        };

        reader.close();
        writer.close();

        assert!(matches!(
            reader.read_frame().await,
            ReadOutcome::Fatal(CommutatorError::Disconnected { .. })
        ));
        assert!(matches!(
            writer.write_frame(b"x").await,
            Err(CommutatorError::Disconnected { .. })
        ));
    }
}
