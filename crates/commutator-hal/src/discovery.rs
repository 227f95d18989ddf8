//! Discovery adapter: turns a list of discovered devices into registered
//! connections.
//!
//! How devices are found is someone else's problem; a [`DeviceDiscovery`]
//! simply yields `(identity, port)` pairs with a little device metadata.
//! [`populate`] opens each port with the fixed link settings, binds the
//! identity, and registers the result.  A port that fails to open is
//! reported and skipped; the rest of the list is still processed.

use std::sync::Arc;

use commutator_types::{CommutatorError, DeviceId};
use tracing::{info, warn};

use crate::connection::Connection;
use crate::registry::ConnectionRegistry;
use crate::transport::{LinkSettings, TransportOpener};

/// What kind of device sits behind a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Emits readings; never commanded.
    Sensor,
    /// Accepts commands on the given output pin.
    Valve { pin: i64 },
}

/// One entry of a discovery result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub identity: DeviceId,
    pub port: String,
    pub kind: DeviceKind,
    /// Overrides the default line speed for this port.
    pub baud_rate: Option<u32>,
}

impl DiscoveredDevice {
    pub fn sensor(identity: impl Into<DeviceId>, port: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            port: port.into(),
            kind: DeviceKind::Sensor,
            baud_rate: None,
        }
    }

    pub fn valve(identity: impl Into<DeviceId>, port: impl Into<String>, pin: i64) -> Self {
        Self {
            identity: identity.into(),
            port: port.into(),
            kind: DeviceKind::Valve { pin },
            baud_rate: None,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = Some(baud_rate);
        self
    }

    fn default_pin(&self) -> Option<i64> {
        match self.kind {
            DeviceKind::Sensor => None,
            DeviceKind::Valve { pin } => Some(pin),
        }
    }
}

/// Source of discovery results.
pub trait DeviceDiscovery: Send + Sync {
    fn discover(&self) -> Vec<DiscoveredDevice>;
}

/// Discovery from a fixed list, typically the configuration file.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    devices: Vec<DiscoveredDevice>,
}

impl StaticDiscovery {
    pub fn new(devices: Vec<DiscoveredDevice>) -> Self {
        Self { devices }
    }
}

impl DeviceDiscovery for StaticDiscovery {
    fn discover(&self) -> Vec<DiscoveredDevice> {
        self.devices.clone()
    }
}

/// Outcome of one [`populate`] pass.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub registered: Vec<DeviceId>,
    pub skipped: Vec<(DiscoveredDevice, CommutatorError)>,
}

/// Open, bind, and register every discovered device.
///
/// Ports or identities that are already registered are skipped without
/// being opened again, so running discovery twice never duplicates a
/// connection.
pub async fn populate(
    registry: &ConnectionRegistry,
    discovery: &dyn DeviceDiscovery,
    opener: &dyn TransportOpener,
    link: &LinkSettings,
) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();

    for device in discovery.discover() {
        match attach(registry, &device, opener, link).await {
            Ok(()) => {
                info!(identity = %device.identity, port = %device.port, kind = ?device.kind, "device attached");
                report.registered.push(device.identity.clone());
            }
            Err(e) => {
                warn!(identity = %device.identity, port = %device.port, error = %e, "skipping device");
                report.skipped.push((device, e));
            }
        }
    }
    report
}

async fn attach(
    registry: &ConnectionRegistry,
    device: &DiscoveredDevice,
    opener: &dyn TransportOpener,
    link: &LinkSettings,
) -> Result<(), CommutatorError> {
    if registry.lookup_by_port(&device.port).is_some() {
        return Err(CommutatorError::PortInUse(device.port.clone()));
    }
    if registry.lookup_by_identity(device.identity.as_str()).is_some() {
        return Err(CommutatorError::IdentityInUse(device.identity.clone()));
    }

    let settings = LinkSettings {
        baud_rate: device.baud_rate.unwrap_or(link.baud_rate),
        ..*link
    };
    let transport = opener.open(&device.port, &settings)?;
    let connection = Arc::new(Connection::bound(
        device.port.clone(),
        transport,
        device.identity.clone(),
        device.default_pin(),
    )?);

    if let Err(e) = registry.register(Arc::clone(&connection)) {
        connection.close().await;
        return Err(e);
    }
    Ok(())
}
