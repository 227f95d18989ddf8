//! Bridge configuration – reads `commutator.toml`.
//!
//! The file is located by, in order: the `--config <path>` argument, the
//! `COMMUTATOR_CONFIG` environment variable (both handled by [`Cli`]), then
//! `./commutator.toml`.  A
//! missing file, a missing `[mqtt]` table, or a file that lists no devices
//! is an error; everything else has a default.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use commutator_hal::{DiscoveredDevice, LinkSettings};
use commutator_middleware::mqtt::generate_client_id;
use commutator_middleware::{Addressing, DEFAULT_INBOUND_CAPACITY, MqttSettings};
use commutator_runtime::CommutatorConfig;
use serde::{Deserialize, Deserializer};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const DEFAULT_CONFIG_FILE: &str = "commutator.toml";

/// Characters that cannot appear in a device id because the id is spliced
/// into MQTT topic names.
const FORBIDDEN_ID_CHARS: [char; 4] = ['/', '+', '#', '\0'];

/// Command line.
#[derive(Debug, Parser)]
#[command(name = "commutator", version, about = "Serial device ↔ MQTT bridge")]
pub struct Cli {
    /// Path to the configuration file [default: ./commutator.toml]
    #[arg(short, long, env = "COMMUTATOR_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Broker password.  Wiped from memory on drop and never printed.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub valves: Vec<ValveConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Generated (`commutator-<uuid>`) when absent.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Password>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub addressing: Addressing,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    #[serde(deserialize_with = "device_id")]
    pub id: String,
    pub port: String,
    #[serde(default)]
    pub baud_rate: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValveConfig {
    #[serde(deserialize_with = "device_id")]
    pub id: String,
    pub port: String,
    pub pin: i64,
    #[serde(default)]
    pub baud_rate: Option<u32>,
}

fn default_broker() -> String {
    "localhost".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_base_topic() -> String {
    "commutator".to_string()
}
fn default_keep_alive_secs() -> u64 {
    60
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_baud_rate() -> u32 {
    commutator_hal::transport::DEFAULT_BAUD_RATE
}
fn default_read_timeout_ms() -> u64 {
    50
}
fn default_write_timeout_ms() -> u64 {
    500
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_inbound_queue() -> usize {
    DEFAULT_INBOUND_CAPACITY
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            addressing: Addressing::default(),
            poll_interval_ms: default_poll_interval_ms(),
            inbound_queue: default_inbound_queue(),
        }
    }
}

/// Device ids may be written as strings or bare integers (`id = 3`).
fn device_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

impl Config {
    /// Every configured device, sensors first, in file order.
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        let sensors = self.sensors.iter().map(|s| {
            let device = DiscoveredDevice::sensor(s.id.as_str(), s.port.as_str());
            match s.baud_rate {
                Some(baud) => device.with_baud_rate(baud),
                None => device,
            }
        });
        let valves = self.valves.iter().map(|v| {
            let device = DiscoveredDevice::valve(v.id.as_str(), v.port.as_str(), v.pin);
            match v.baud_rate {
                Some(baud) => device.with_baud_rate(baud),
                None => device,
            }
        });
        sensors.chain(valves).collect()
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        let mqtt = &self.mqtt;
        let mut settings = MqttSettings::new(mqtt.broker.clone(), mqtt.port);
        settings.client_id = mqtt.client_id.clone().unwrap_or_else(generate_client_id);
        settings.keep_alive = Duration::from_secs(mqtt.keep_alive_secs);
        settings.connect_timeout = Duration::from_secs(mqtt.connect_timeout_secs);
        if let Some(username) = &mqtt.username {
            let password = Zeroizing::new(
                mqtt.password
                    .as_ref()
                    .map(|p| p.expose().to_string())
                    .unwrap_or_default(),
            );
            settings.credentials = Some((username.clone(), password));
        }
        settings
    }

    pub fn commutator_config(&self) -> CommutatorConfig {
        CommutatorConfig {
            base_topic: self.mqtt.base_topic.clone(),
            addressing: self.bridge.addressing,
            poll_interval: Duration::from_millis(self.bridge.poll_interval_ms),
            write_timeout: Duration::from_millis(self.serial.write_timeout_ms),
            link: LinkSettings {
                baud_rate: self.serial.baud_rate,
                read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
            },
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.sensors.is_empty() && self.valves.is_empty() {
            return Err("no devices configured: add at least one [[sensors]] or [[valves]] entry".to_string());
        }
        let ids = self.sensors.iter().map(|s| (&s.id, &s.port)).chain(self.valves.iter().map(|v| (&v.id, &v.port)));
        for (id, port) in ids {
            if id.trim().is_empty() {
                return Err(format!("device on port '{port}' has an empty id"));
            }
            if port.trim().is_empty() {
                return Err(format!("device '{id}' has an empty port"));
            }
            if let Some(c) = id.chars().find(|c| FORBIDDEN_ID_CHARS.contains(c)) {
                return Err(format!(
                    "device id '{}' contains '{}', which is not allowed in a topic segment",
                    id.escape_debug(),
                    c.escape_debug()
                ));
            }
        }
        if self.mqtt.base_topic.contains(['+', '#', '\0']) {
            return Err(format!(
                "base_topic '{}' must not contain wildcards",
                self.mqtt.base_topic.escape_debug()
            ));
        }
        if self.bridge.addressing == Addressing::LegacyValve {
            if let Some(v) = self.valves.iter().find(|v| v.id.parse::<u64>().is_err()) {
                return Err(format!(
                    "addressing = \"legacy-valve\" requires numeric valve ids, got '{}'",
                    v.id
                ));
            }
        }
        Ok(())
    }
}

impl Cli {
    /// The configured path, or `./commutator.toml`.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }
}

/// Load, override from the environment, and validate.
pub fn load_from(path: &Path) -> Result<Config, String> {
    if !path.exists() {
        return Err(format!("Config file not found at {}", path.display()));
    }
    let raw = fs::read_to_string(path).map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config at {}: {}", path.display(), e))?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Apply `COMMUTATOR_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `COMMUTATOR_MQTT_BROKER` | `mqtt.broker` |
/// | `COMMUTATOR_MQTT_PORT` | `mqtt.port` |
/// | `COMMUTATOR_BASE_TOPIC` | `mqtt.base_topic` |
/// | `COMMUTATOR_ADDRESSING` | `bridge.addressing` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("COMMUTATOR_MQTT_BROKER") {
        cfg.mqtt.broker = v;
    }
    if let Some(v) = lookup("COMMUTATOR_MQTT_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.mqtt.port = port;
    }
    if let Some(v) = lookup("COMMUTATOR_BASE_TOPIC") {
        cfg.mqtt.base_topic = v;
    }
    if let Some(v) = lookup("COMMUTATOR_ADDRESSING")
        && let Ok(addressing) = v.parse::<Addressing>()
    {
        cfg.bridge.addressing = addressing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commutator_hal::DeviceKind;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
[mqtt]

[[sensors]]
id = "dev-1"
port = "/dev/ttyUSB0"
"#;

    fn parse(raw: &str) -> Config {
        toml::from_str(raw).expect("valid toml")
    }

    fn write(dir: &tempfile::TempDir, raw: &str) -> PathBuf {
        let path = dir.path().join("commutator.toml");
        std::fs::write(&path, raw).expect("write config");
        path
    }

    #[test]
    fn defaults_fill_everything_but_devices() {
        let cfg = parse(MINIMAL);
        assert_eq!(cfg.mqtt.broker, "localhost");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.base_topic, "commutator");
        assert_eq!(cfg.mqtt.keep_alive_secs, 60);
        assert_eq!(cfg.mqtt.connect_timeout_secs, 10);
        assert_eq!(cfg.serial.baud_rate, 115_200);
        assert_eq!(cfg.serial.read_timeout_ms, 50);
        assert_eq!(cfg.serial.write_timeout_ms, 500);
        assert_eq!(cfg.bridge.addressing, Addressing::Body);
        assert_eq!(cfg.bridge.poll_interval_ms, 10);
        assert_eq!(cfg.bridge.inbound_queue, 64);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn full_file_maps_to_runtime_settings() {
        let cfg = parse(
            r#"
[mqtt]
broker = "broker.plant"
port = 8883
base_topic = "plant/line-1"
client_id = "bridge-a"
username = "bridge"
password = "s3cret"

[serial]
baud_rate = 9600
write_timeout_ms = 250

[bridge]
addressing = "legacy-valve"
poll_interval_ms = 20

[[sensors]]
id = "temp-1"
port = "/dev/ttyUSB0"
baud_rate = 57600

[[valves]]
id = 3
port = "/dev/ttyUSB1"
pin = 7
"#,
        );

        let devices = cfg.discovered_devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].baud_rate, Some(57600));
        assert_eq!(devices[1].identity.as_str(), "3");
        assert_eq!(devices[1].kind, DeviceKind::Valve { pin: 7 });

        let runtime = cfg.commutator_config();
        assert_eq!(runtime.base_topic, "plant/line-1");
        assert_eq!(runtime.addressing, Addressing::LegacyValve);
        assert_eq!(runtime.poll_interval, Duration::from_millis(20));
        assert_eq!(runtime.write_timeout, Duration::from_millis(250));
        assert_eq!(runtime.link.baud_rate, 9600);

        let mqtt = cfg.mqtt_settings();
        assert_eq!(mqtt.host, "broker.plant");
        assert_eq!(mqtt.port, 8883);
        assert_eq!(mqtt.client_id, "bridge-a");
        let (username, password) = mqtt.credentials.as_ref().expect("credentials");
        assert_eq!(username, "bridge");
        assert_eq!(password.as_str(), "s3cret");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn generated_client_id_when_absent() {
        let cfg = parse(MINIMAL);
        assert!(cfg.mqtt_settings().client_id.starts_with("commutator-"));
    }

    #[test]
    fn debug_redacts_password() {
        let cfg = parse(
            r#"
[mqtt]
username = "bridge"
password = "hunter2"

[[sensors]]
id = "a"
port = "/a"
"#,
        );
        let debug = format!("{cfg:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn missing_mqtt_section_is_rejected() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write(&dir, "[[sensors]]\nid = \"a\"\nport = \"/a\"\n");
        let err = load_from(&path).unwrap_err();
        assert!(err.contains("mqtt"), "{err}");
    }

    #[test]
    fn no_devices_is_rejected() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write(&dir, "[mqtt]\n");
        let err = load_from(&path).unwrap_err();
        assert!(err.contains("no devices"), "{err}");
    }

    #[test]
    fn missing_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let err = load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn load_from_reads_valid_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write(&dir, MINIMAL);
        let cfg = load_from(&path).expect("load ok");
        assert_eq!(cfg.sensors[0].id, "dev-1");
    }

    #[test]
    fn legacy_addressing_requires_numeric_valve_ids() {
        let cfg = parse(
            r#"
[mqtt]
[bridge]
addressing = "legacy-valve"
[[valves]]
id = "main-inlet"
port = "/v"
pin = 2
"#,
        );
        assert!(cfg.validate().unwrap_err().contains("numeric"));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("COMMUTATOR_MQTT_BROKER", "10.0.0.5"),
            ("COMMUTATOR_MQTT_PORT", "not-a-port"),
            ("COMMUTATOR_BASE_TOPIC", "site"),
            ("COMMUTATOR_ADDRESSING", "topic"),
        ]);
        let mut cfg = parse(MINIMAL);
        apply_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.mqtt.broker, "10.0.0.5");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.base_topic, "site");
        assert_eq!(cfg.bridge.addressing, Addressing::Topic);
    }

    #[test]
    fn topic_metacharacters_in_ids_are_rejected() {
        for id in ["line/1", "temp+", "all#", "nul\u{0}"] {
            let mut cfg = parse(MINIMAL);
            cfg.sensors[0].id = id.to_string();
            let err = cfg.validate().unwrap_err();
            assert!(err.contains("not allowed"), "{id:?}: {err}");
        }

        let mut cfg = parse(MINIMAL);
        cfg.mqtt.base_topic = "plant/#".to_string();
        assert!(cfg.validate().unwrap_err().contains("wildcards"));
    }

    #[test]
    fn config_argument_forms() {
        let cli = Cli::try_parse_from(["commutator", "--config", "x.toml"]).unwrap();
        assert_eq!(cli.config_path(), PathBuf::from("x.toml"));
        let cli = Cli::try_parse_from(["commutator", "--config=y.toml"]).unwrap();
        assert_eq!(cli.config_path(), PathBuf::from("y.toml"));
        let cli = Cli::try_parse_from(["commutator", "-c", "z.toml"]).unwrap();
        assert_eq!(cli.config_path(), PathBuf::from("z.toml"));

        assert!(Cli::try_parse_from(["commutator", "--config"]).is_err());
        assert!(Cli::try_parse_from(["commutator", "--verbose"]).is_err());
    }

    #[test]
    fn default_path_when_nothing_is_given() {
        let cli = Cli { config: None };
        assert_eq!(cli.config_path(), PathBuf::from("commutator.toml"));
        let cli = Cli { config: Some(PathBuf::new()) };
        assert_eq!(cli.config_path(), PathBuf::from("commutator.toml"));
    }
}
