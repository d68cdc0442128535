//! Event-driven BLE driver surface
//!
//! Calls only start an operation; its outcome arrives later as a
//! [`DriverEvent`]. Errors returned directly mean the call was refused
//! outright. Device managers cannot tell a local driver from a remote one.

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{DriverEvent, GattCharacteristic, GattDescriptor, ScanFilter};

/// Capacity of every driver's event channel
pub const EVENT_CAPACITY: usize = 512;

#[async_trait]
pub trait BleDriver: Send + Sync {
    /// Subscribe to the driver's events
    fn events(&self) -> broadcast::Receiver<DriverEvent>;

    /// Start a scan identified by `scan_id`; answered by `ScanStarted`
    async fn start_scan(&self, scan_id: &str, filter: ScanFilter) -> Result<()>;

    async fn stop_scan(&self, scan_id: &str) -> Result<()>;

    async fn connect_gatt(&self, address: &str) -> Result<()>;

    async fn close_gatt(&self, address: &str) -> Result<()>;

    async fn discover_services(&self, address: &str) -> Result<()>;

    async fn enable_notifications(
        &self,
        address: &str,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<()>;

    async fn read_characteristic(&self, address: &str, characteristic: Uuid) -> Result<()>;

    async fn write_characteristic(
        &self,
        address: &str,
        characteristic: GattCharacteristic,
    ) -> Result<()>;

    async fn write_descriptor(
        &self,
        address: &str,
        characteristic: Uuid,
        descriptor: GattDescriptor,
    ) -> Result<()>;
}

/// Every driver call, used to log and replay calls across the remote hop
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    StartScan { scan_id: String, filter: ScanFilter },
    StopScan { scan_id: String },
    ConnectGatt { address: String },
    CloseGatt { address: String },
    DiscoverServices { address: String },
    EnableNotifications { address: String, characteristic: Uuid, enable: bool },
    ReadCharacteristic { address: String, characteristic: Uuid },
    WriteCharacteristic { address: String, characteristic: GattCharacteristic },
    WriteDescriptor { address: String, characteristic: Uuid, descriptor: GattDescriptor },
}

impl DriverCall {
    /// Run this call against a driver
    pub async fn invoke(self, driver: &dyn BleDriver) -> Result<()> {
        match self {
            DriverCall::StartScan { scan_id, filter } => driver.start_scan(&scan_id, filter).await,
            DriverCall::StopScan { scan_id } => driver.stop_scan(&scan_id).await,
            DriverCall::ConnectGatt { address } => driver.connect_gatt(&address).await,
            DriverCall::CloseGatt { address } => driver.close_gatt(&address).await,
            DriverCall::DiscoverServices { address } => driver.discover_services(&address).await,
            DriverCall::EnableNotifications {
                address,
                characteristic,
                enable,
            } => {
                driver
                    .enable_notifications(&address, characteristic, enable)
                    .await
            }
            DriverCall::ReadCharacteristic {
                address,
                characteristic,
            } => driver.read_characteristic(&address, characteristic).await,
            DriverCall::WriteCharacteristic {
                address,
                characteristic,
            } => driver.write_characteristic(&address, characteristic).await,
            DriverCall::WriteDescriptor {
                address,
                characteristic,
                descriptor,
            } => {
                driver
                    .write_descriptor(&address, characteristic, descriptor)
                    .await
            }
        }
    }

    /// Device the call targets
    pub fn address(&self) -> Option<&str> {
        match self {
            DriverCall::StartScan { .. } | DriverCall::StopScan { .. } => None,
            DriverCall::ConnectGatt { address }
            | DriverCall::CloseGatt { address }
            | DriverCall::DiscoverServices { address }
            | DriverCall::EnableNotifications { address, .. }
            | DriverCall::ReadCharacteristic { address, .. }
            | DriverCall::WriteCharacteristic { address, .. }
            | DriverCall::WriteDescriptor { address, .. } => Some(address),
        }
    }
}
