//! Topic layout and inbound addressing.
//!
//! | Direction | Topic |
//! |---|---|
//! | device data (out) | `{base}/devices/{identity}/data` |
//! | command status (out) | `{base}/devices/{identity}/status` |
//! | commands (in) | `{base}/devices/+/command` |
//! | legacy valve commands (in) | `{base}/valves/+/command` |
//!
//! Which part of an inbound message names the target device is selected by
//! [`Addressing`].

use std::fmt;
use std::str::FromStr;

use commutator_types::DeviceId;
use serde::{Deserialize, Serialize};

/// Where the dispatcher looks for the target identity of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Addressing {
    /// The `uuid` field of the JSON body; subscribes to `devices/+/command`.
    #[default]
    Body,
    /// The `+` segment of `devices/+/command`.
    Topic,
    /// The numeric `+` segment of `valves/+/command`.
    LegacyValve,
}

impl fmt::Display for Addressing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addressing::Body => f.write_str("body"),
            Addressing::Topic => f.write_str("topic"),
            Addressing::LegacyValve => f.write_str("legacy-valve"),
        }
    }
}

impl FromStr for Addressing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "body" => Ok(Addressing::Body),
            "topic" => Ok(Addressing::Topic),
            "legacy-valve" | "legacy_valve" | "legacy" => Ok(Addressing::LegacyValve),
            other => Err(format!("unknown addressing scheme '{other}'")),
        }
    }
}

/// Builds and parses topics under a configurable base prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    base: String,
}

impl TopicScheme {
    pub fn new(base: impl AsRef<str>) -> Self {
        Self {
            base: base.as_ref().trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn data_topic(&self, identity: &DeviceId) -> String {
        format!("{}/devices/{identity}/data", self.base)
    }

    pub fn status_topic(&self, identity: &DeviceId) -> String {
        format!("{}/devices/{identity}/status", self.base)
    }

    /// Subscription filter for inbound commands under `addressing`.
    pub fn command_filter(&self, addressing: Addressing) -> String {
        match addressing {
            Addressing::Body | Addressing::Topic => format!("{}/devices/+/command", self.base),
            Addressing::LegacyValve => format!("{}/valves/+/command", self.base),
        }
    }

    /// Extract the identity segment from a command topic.
    ///
    /// Returns `None` if the topic does not have the command shape for
    /// `addressing`, the segment is empty, or (for legacy valves) the
    /// segment is not a non-negative integer.
    pub fn identity_from_topic(&self, topic: &str, addressing: Addressing) -> Option<DeviceId> {
        let collection = match addressing {
            Addressing::Body | Addressing::Topic => "devices",
            Addressing::LegacyValve => "valves",
        };
        let segment = topic
            .strip_prefix(self.base.as_str())?
            .strip_prefix('/')?
            .strip_prefix(collection)?
            .strip_prefix('/')?
            .strip_suffix("/command")?;
        if segment.is_empty() || segment.contains('/') {
            return None;
        }

        match addressing {
            Addressing::LegacyValve => segment.parse::<u64>().ok().map(|n| DeviceId::new(n.to_string())),
            Addressing::Body | Addressing::Topic => Some(DeviceId::from(segment)),
        }
    }
}

/// MQTT topic filter matching: `+` matches one level, a trailing `#`
/// matches any remaining levels (including none).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
