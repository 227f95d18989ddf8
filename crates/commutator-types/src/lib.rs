//! `commutator-types` – shared vocabulary for the serial-to-broker bridge.
//!
//! Every other crate in the workspace speaks in terms of the types defined
//! here: the opaque [`DeviceId`] assigned by discovery, the command as it
//! arrives from the broker ([`InboundCommand`]), the command as it is written
//! to a device ([`DeviceCommand`]), the acknowledgement published back
//! ([`StatusReport`]), and the single workspace-wide error type
//! ([`CommutatorError`]).

use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Command type written to a device when the inbound message omits `type`.
pub const DEFAULT_COMMAND_TYPE: i64 = 1;

/// Command code written to a device when the inbound message omits `command`.
/// `17` is the firmware's "set valve output" opcode.
pub const DEFAULT_COMMAND_CODE: i64 = 17;

// ─────────────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque, globally unique device token assigned by discovery.
///
/// This is the addressing key for every broker-facing operation; the physical
/// port a device hangs off is never exposed to broker consumers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// A command as received from the broker.
///
/// Only `uuid` may be absent without a default; whether it is required
/// depends on the configured addressing scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundCommand {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(rename = "type", default = "default_command_type")]
    pub command_type: i64,
    #[serde(default = "default_command_code")]
    pub command: i64,
    #[serde(default)]
    pub pin: Option<i64>,
    #[serde(default)]
    pub status: bool,
}

fn default_command_type() -> i64 {
    DEFAULT_COMMAND_TYPE
}

fn default_command_code() -> i64 {
    DEFAULT_COMMAND_CODE
}

impl InboundCommand {
    /// Interpret an already-parsed JSON body as a command.
    ///
    /// # Errors
    ///
    /// Returns [`CommutatorError::Parse`] when the body is not a JSON object
    /// or a field carries the wrong JSON type (e.g. `"status": "on"`).
    pub fn from_json(body: &Value) -> Result<Self, CommutatorError> {
        if !body.is_object() {
            return Err(CommutatorError::Parse(format!(
                "command body must be a JSON object, got {body}"
            )));
        }
        Self::deserialize(body).map_err(|e| CommutatorError::Parse(e.to_string()))
    }

    /// Translate into the device-facing schema for `identity`.
    ///
    /// `default_pin` is the pin configured for the device and is only used
    /// when the command itself does not carry one.
    pub fn to_device_command(&self, identity: &DeviceId, default_pin: Option<i64>) -> DeviceCommand {
        DeviceCommand {
            uuid: identity.clone(),
            command_type: self.command_type,
            command: self.command,
            valve_pin: self.pin.or(default_pin),
            status: self.status,
        }
    }
}

/// The command schema understood by device firmware, written to the
/// transport as one JSON frame.
///
/// Field order is part of the wire format: `uuid`, `type`, `command`,
/// `valve_pin`, `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub uuid: DeviceId,
    #[serde(rename = "type")]
    pub command_type: i64,
    pub command: i64,
    pub valve_pin: Option<i64>,
    pub status: bool,
}

impl DeviceCommand {
    /// Serialise to the JSON bytes written to the device (without framing).
    pub fn to_frame(&self) -> Result<Vec<u8>, CommutatorError> {
        serde_json::to_vec(self).map_err(|e| CommutatorError::Serialization(e.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of writing a command to a device transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Delivered => f.write_str("delivered"),
            DeliveryStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Command acknowledgement published on `…/devices/{id}/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    /// The inbound command body, echoed unchanged.
    pub command: Value,
    pub status: DeliveryStatus,
}

impl StatusReport {
    /// Build a report stamped with the current time.
    pub fn now(command: Value, status: DeliveryStatus) -> Self {
        Self {
            timestamp: Utc::now(),
            command,
            status,
        }
    }
}

/// One unit of data read from a device, tagged with the identity of the
/// connection it came from.  Forwarded to the broker verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDatum {
    pub identity: DeviceId,
    pub payload: Vec<u8>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error type spanning transport failures, registry
/// conflicts, malformed broker input, and broker I/O.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommutatorError {
    #[error("Cannot open {port}: {details}")]
    TransportOpen { port: String, details: String },

    #[error("Transport error on {port}: {details}")]
    Transport { port: String, details: String },

    #[error("Connection on {port} lost: {details}")]
    Disconnected { port: String, details: String },

    #[error("Port already registered: {0}")]
    PortInUse(String),

    #[error("Device identity already bound: {0}")]
    IdentityInUse(DeviceId),

    #[error("Connection on {0} has no bound identity")]
    UnboundConnection(String),

    #[error("Malformed command: {0}")]
    Parse(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("{operation} timed out after {millis} ms")]
    Timeout { operation: String, millis: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn device_command_wire_format_matches_firmware_schema() {
        let body = json!({"uuid": "dev-1", "type": 1, "command": 17, "pin": 3, "status": true});
        let cmd = InboundCommand::from_json(&body).unwrap();
        let device = cmd.to_device_command(&DeviceId::from("dev-1"), None);
        let frame = String::from_utf8(device.to_frame().unwrap()).unwrap();
        assert_eq!(
            frame,
            r#"{"uuid":"dev-1","type":1,"command":17,"valve_pin":3,"status":true}"#
        );
    }

    #[test]
    fn missing_fields_take_documented_defaults() {
        let cmd = InboundCommand::from_json(&json!({})).unwrap();
        assert_eq!(cmd.uuid, None);
        assert_eq!(cmd.command_type, DEFAULT_COMMAND_TYPE);
        assert_eq!(cmd.command, DEFAULT_COMMAND_CODE);
        assert_eq!(cmd.pin, None);
        assert!(!cmd.status);

        let device = cmd.to_device_command(&DeviceId::from("v"), None);
        let frame = String::from_utf8(device.to_frame().unwrap()).unwrap();
        assert!(frame.contains(r#""valve_pin":null"#));
        assert!(frame.contains(r#""status":false"#));
    }

    #[test]
    fn explicit_pin_wins_over_device_default() {
        let cmd = InboundCommand::from_json(&json!({"pin": 7})).unwrap();
        assert_eq!(cmd.to_device_command(&"v".into(), Some(3)).valve_pin, Some(7));

        let cmd = InboundCommand::from_json(&json!({"status": true})).unwrap();
        assert_eq!(cmd.to_device_command(&"v".into(), Some(3)).valve_pin, Some(3));
    }

    #[test]
    fn wrongly_typed_fields_are_parse_errors() {
        for body in [
            json!({"status": "on"}),
            json!({"type": "one"}),
            json!({"pin": 2.5}),
            json!([1, 2, 3]),
            json!("dev-1"),
        ] {
            let err = InboundCommand::from_json(&body).unwrap_err();
            assert!(matches!(err, CommutatorError::Parse(_)), "{body} -> {err:?}");
        }
    }

    #[test]
    fn status_report_serialises_lowercase_outcome() {
        let report = StatusReport::now(json!({"uuid": "dev-1"}), DeliveryStatus::Failed);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["command"]["uuid"], "dev-1");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn device_id_is_transparent_in_json() {
        let id = DeviceId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""abc""#);
        assert_eq!(id.to_string(), "abc");
    }

    #[test]
    fn error_display_names_the_port() {
        let err = CommutatorError::TransportOpen {
            port: "/dev/ttyUSB0".to_string(),
            details: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/dev/ttyUSB0"));
        assert!(CommutatorError::IdentityInUse("dev-1".into()).to_string().contains("dev-1"));
    }
}
