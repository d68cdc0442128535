//! Device kinds
//!
//! A [`DeviceKind`] tells a device manager how to find, connect and decode one
//! family of devices. Kinds are registered in a fixed [`KindRegistry`] keyed
//! by the `type` tag stored on each `Device`.

mod hr;
mod keiser;

pub use hr::{
    parse_heart_rate, HeartRateKind, BATTERY_LEVEL, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE,
    MANUFACTURER_NAME,
};
pub use keiser::{parse_keiser, KeiserKind, KEISER_COMPANY_ID};

use std::collections::BTreeMap;
use std::sync::Arc;

use fitbridge_ble::{FoundDevice, GattCharacteristic, ScanFilter};
use fitbridge_core::{Derivator, DerivatorConfig, Sample};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Connection Strategy
// ----------------------------------------------------------------------------

/// How a manager obtains samples from its device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStrategy {
    /// Connect, discover services and subscribe to notifications
    Gatt,
    /// Keep scanning and decode every advertisement
    Advertisement,
}

/// Values read once after connecting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
}

// ----------------------------------------------------------------------------
// Device Kind Trait
// ----------------------------------------------------------------------------

pub trait DeviceKind: Send + Sync {
    /// Tag stored in `Device.type`
    fn tag(&self) -> &'static str;

    fn strategy(&self) -> ConnectStrategy;

    /// Filter used by `search(true)`
    fn search_filter(&self) -> ScanFilter;

    /// Filter used while connecting to a known address
    fn connect_filter(&self, address: &str) -> ScanFilter {
        ScanFilter::default().with_address(address)
    }

    /// Whether an advertisement comes from a device of this kind
    fn recognizes(&self, found: &FoundDevice) -> bool;

    /// Characteristics read once after service discovery
    fn read_characteristics(&self) -> &'static [Uuid] {
        &[]
    }

    /// Characteristics whose notifications carry samples
    fn notify_characteristics(&self) -> &'static [Uuid] {
        &[]
    }

    fn parse_notification(&self, _characteristic: &GattCharacteristic) -> Option<Sample> {
        None
    }

    fn parse_advertisement(&self, _found: &FoundDevice) -> Option<Sample> {
        None
    }

    /// Store the value of a read-once characteristic
    fn parse_read(&self, _characteristic: &GattCharacteristic, _info: &mut DeviceInfo) {}

    /// Attach read-once values to a fresh sample
    fn decorate(&self, _sample: &mut Sample, _info: &DeviceInfo) {}

    fn derivator(&self, config: &DerivatorConfig) -> Box<dyn Derivator>;

    /// Higher wins when picking the notification source
    fn notification_priority(&self) -> i32 {
        0
    }

    fn notification_text(&self, alias: &str, sample: &Sample) -> Option<String>;
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Known device kinds by tag
#[derive(Clone)]
pub struct KindRegistry {
    kinds: BTreeMap<&'static str, Arc<dyn DeviceKind>>,
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl KindRegistry {
    pub fn empty() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    /// Heart-rate sensors and Keiser M3i bikes
    pub fn builtin() -> Self {
        Self::empty()
            .with_kind(Arc::new(HeartRateKind))
            .with_kind(Arc::new(KeiserKind))
    }

    pub fn with_kind(mut self, kind: Arc<dyn DeviceKind>) -> Self {
        self.kinds.insert(kind.tag(), kind);
        self
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn DeviceKind>> {
        self.kinds.get(tag).cloned()
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.kinds.keys().copied()
    }
}
