//! Device identity: a hardware-derived id mapped to a zone profile.
//!
//! The mapping is plain data from the `[[zones]]` table. Every device
//! resolves to exactly one [`ZoneProfile`]; unknown ids get the generic
//! profile instead of an error.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::ZoneEntry;

/// Zone name used for devices missing from the table.
pub const UNKNOWN_ZONE: &str = "unknown";

/// Config-feed slots holding this zone's alert thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFields {
    pub alarm_temp: String,
    pub alarm_hum: String,
}

/// Telemetry-sink slots receiving this zone's readings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFields {
    pub temp: String,
    pub hum: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneProfile {
    pub name: String,
    pub config_fields: ConfigFields,
    pub data_fields: DataFields,
}

impl ZoneProfile {
    /// Generic profile: thresholds in `field2`/`field3`, data in the first
    /// two slots.
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN_ZONE.to_string(),
            config_fields: ConfigFields {
                alarm_temp: "field2".into(),
                alarm_hum: "field3".into(),
            },
            data_fields: DataFields {
                temp: "field1".into(),
                hum: "field2".into(),
            },
        }
    }
}

impl From<&ZoneEntry> for ZoneProfile {
    fn from(z: &ZoneEntry) -> Self {
        Self {
            name: z.name.clone(),
            config_fields: ConfigFields {
                alarm_temp: z.alarm_temp_field.clone(),
                alarm_hum: z.alarm_hum_field.clone(),
            },
            data_fields: DataFields {
                temp: z.temp_field.clone(),
                hum: z.hum_field.clone(),
            },
        }
    }
}

/// Computed once at boot, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub zone: ZoneProfile,
}

impl DeviceIdentity {
    pub fn is_known(&self) -> bool {
        self.zone.name != UNKNOWN_ZONE
    }
}

/// Canonical form of a hardware id: separators dropped, upper case, so
/// `ec:62:60:9c:89:00` and `EC62609C8900` are the same device.
pub fn normalize_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

// ---------------------------------------------------------------------------
// Hardware id sources
// ---------------------------------------------------------------------------

/// Where the hardware-unique id comes from. Never user-configurable.
pub trait HardwareId {
    fn read_id(&self) -> Option<String>;
}

/// MAC address of a network interface, as exposed by sysfs.
pub struct MacAddress {
    iface: String,
    sysfs_root: PathBuf,
}

impl MacAddress {
    pub fn new(iface: &str) -> Self {
        Self {
            iface: iface.to_string(),
            sysfs_root: PathBuf::from("/sys/class/net"),
        }
    }
}

impl HardwareId for MacAddress {
    fn read_id(&self) -> Option<String> {
        let path = self.sysfs_root.join(&self.iface).join("address");
        match std::fs::read_to_string(&path) {
            Ok(s) => Some(normalize_id(s.trim())).filter(|id| !id.is_empty()),
            Err(e) => {
                tracing::warn!(iface = %self.iface, "cannot read MAC address: {e}");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct IdentityResolver {
    table: HashMap<String, ZoneProfile>,
}

impl IdentityResolver {
    pub fn new(zones: &[ZoneEntry]) -> Self {
        let table = zones
            .iter()
            .map(|z| (normalize_id(&z.device_id), ZoneProfile::from(z)))
            .collect();
        Self { table }
    }

    /// Read the hardware id and map it to a zone. Always succeeds.
    pub fn resolve(&self, source: &impl HardwareId) -> DeviceIdentity {
        let device_id = source.read_id().unwrap_or_default();
        let identity = self.lookup(&device_id);

        if identity.is_known() {
            tracing::info!(device_id = %identity.device_id, zone = %identity.zone.name, "device identified");
        } else {
            tracing::warn!(device_id = %identity.device_id, "unknown device id, using fallback zone profile");
        }
        identity
    }

    pub fn lookup(&self, device_id: &str) -> DeviceIdentity {
        let device_id = normalize_id(device_id);
        let zone = self
            .table
            .get(&device_id)
            .cloned()
            .unwrap_or_else(ZoneProfile::unknown);
        DeviceIdentity { device_id, zone }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
