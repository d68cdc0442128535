//! Driver-neutral GATT types and driver events
//!
//! These values cross the remote driver hop as JSON, so byte payloads are
//! carried as hex strings.

use std::time::Duration;

use fitbridge_core::DisconnectReason;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

pub const GATT_SUCCESS: i32 = 0;
pub const GATT_FAILURE: i32 = 0x101;

pub const STATE_DISCONNECTED: i32 = 0;
pub const STATE_CONNECTING: i32 = 1;
pub const STATE_CONNECTED: i32 = 2;
pub const STATE_DISCONNECTING: i32 = 3;

/// Client characteristic configuration descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Expand a 16-bit assigned number into a full Bluetooth base UUID
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

// ----------------------------------------------------------------------------
// GATT Attributes
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattDescriptor {
    pub uuid: Uuid,
    #[serde(with = "hex_bytes", default)]
    pub value: Vec<u8>,
    #[serde(default)]
    pub permissions: u32,
}

impl GattDescriptor {
    pub fn new(uuid: Uuid, value: Vec<u8>) -> Self {
        Self {
            uuid,
            value,
            permissions: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    #[serde(with = "hex_bytes", default)]
    pub value: Vec<u8>,
    #[serde(default)]
    pub permissions: u32,
    /// Property bit flags (read, write, notify, ...)
    #[serde(default)]
    pub properties: u32,
    #[serde(default)]
    pub descriptors: Vec<GattDescriptor>,
}

impl GattCharacteristic {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            value: Vec::new(),
            permissions: 0,
            properties: 0,
            descriptors: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: Uuid,
    #[serde(default)]
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

// ----------------------------------------------------------------------------
// Scanning
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerData {
    pub company_id: u16,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

/// One advertisement seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rssi: Option<i16>,
    #[serde(default)]
    pub manufacturer_data: Vec<ManufacturerData>,
    #[serde(default)]
    pub services: Vec<Uuid>,
}

impl FoundDevice {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            rssi: None,
            manufacturer_data: Vec::new(),
            services: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_manufacturer_data(mut self, company_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.push(ManufacturerData { company_id, data });
        self
    }

    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    pub fn manufacturer(&self, company_id: u16) -> Option<&[u8]> {
        self.manufacturer_data
            .iter()
            .find(|m| m.company_id == company_id)
            .map(|m| m.data.as_slice())
    }
}

/// Which advertisements a scan reports
///
/// Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanFilter {
    pub addresses: Vec<String>,
    pub services: Vec<Uuid>,
    pub manufacturer_ids: Vec<u16>,
    /// Scan window in milliseconds, 0 scans until stopped
    pub timeout_ms: u64,
}

impl ScanFilter {
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_manufacturer(mut self, company_id: u16) -> Self {
        self.manufacturer_ids.push(company_id);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn matches(&self, device: &FoundDevice) -> bool {
        let address_ok = self.addresses.is_empty()
            || self
                .addresses
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&device.address));
        let service_ok = self.services.is_empty()
            || self.services.iter().any(|s| device.services.contains(s));
        let maker_ok = self.manufacturer_ids.is_empty()
            || self
                .manufacturer_ids
                .iter()
                .any(|id| device.manufacturer(*id).is_some());
        address_ok && service_ok && maker_ok
    }
}

// ----------------------------------------------------------------------------
// Driver Events
// ----------------------------------------------------------------------------

/// Callbacks produced by a driver, delivered in order on its event channel
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    DeviceFound(FoundDevice),
    ConnectionStateChange {
        address: String,
        status: i32,
        state: i32,
    },
    Services {
        address: String,
        status: i32,
        services: Vec<GattService>,
    },
    CharacteristicChanged {
        address: String,
        characteristic: GattCharacteristic,
    },
    CharacteristicRead {
        address: String,
        status: i32,
        characteristic: GattCharacteristic,
    },
    CharacteristicWrite {
        address: String,
        status: i32,
        characteristic: GattCharacteristic,
    },
    DescriptorRead {
        address: String,
        status: i32,
        descriptor: GattDescriptor,
    },
    DescriptorWrite {
        address: String,
        status: i32,
        descriptor: GattDescriptor,
    },
    GattRelease {
        address: String,
    },
    ScanStarted {
        scan_id: String,
        status: i32,
    },
    ScanCompleted {
        scan_id: String,
    },
    /// A call accepted earlier failed while running
    OperationFailed {
        address: Option<String>,
        reason: DisconnectReason,
        message: String,
    },
}

impl DriverEvent {
    /// Device the event concerns, if any
    pub fn address(&self) -> Option<&str> {
        match self {
            DriverEvent::DeviceFound(found) => Some(&found.address),
            DriverEvent::ConnectionStateChange { address, .. }
            | DriverEvent::Services { address, .. }
            | DriverEvent::CharacteristicChanged { address, .. }
            | DriverEvent::CharacteristicRead { address, .. }
            | DriverEvent::CharacteristicWrite { address, .. }
            | DriverEvent::DescriptorRead { address, .. }
            | DriverEvent::DescriptorWrite { address, .. }
            | DriverEvent::GattRelease { address } => Some(address),
            DriverEvent::OperationFailed { address, .. } => address.as_deref(),
            DriverEvent::ScanStarted { .. } | DriverEvent::ScanCompleted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid16_expands_to_base_uuid() {
        assert_eq!(
            uuid16(0x2A37).to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(uuid16(0x2902), CCCD_UUID);
    }

    #[test]
    fn test_characteristic_json_carries_hex_value() {
        let c = GattCharacteristic::new(uuid16(0x2A19)).with_value(vec![0x5A, 0x01]);
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"5a01\""));
        let back: GattCharacteristic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_scan_filter_matching() {
        let bike = FoundDevice::new("AA:BB:CC:DD:EE:FF").with_manufacturer_data(0x0102, vec![6, 0x21]);
        assert!(ScanFilter::default().matches(&bike));
        assert!(ScanFilter::default().with_address("aa:bb:cc:dd:ee:ff").matches(&bike));
        assert!(!ScanFilter::default().with_address("11:22:33:44:55:66").matches(&bike));
        assert!(ScanFilter::default().with_manufacturer(0x0102).matches(&bike));
        assert!(!ScanFilter::default().with_service(uuid16(0x180D)).matches(&bike));
    }
}
