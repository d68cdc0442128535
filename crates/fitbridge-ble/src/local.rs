//! Local BLE driver backed by btleplug
//!
//! Every call spawns its GATT operation and reports the outcome on the event
//! channel, the way platform BLE stacks call back. Scans are multiplexed: the
//! adapter scans unfiltered while at least one scan is active, and each
//! advertisement is reported once if any active scan's filter accepts it.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as AdapterScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::driver::{BleDriver, EVENT_CAPACITY};
use crate::error::{BleDriverError, Result};
use crate::types::{
    DriverEvent, FoundDevice, GattCharacteristic, GattDescriptor, GattService, ManufacturerData,
    ScanFilter, CCCD_UUID, GATT_FAILURE, GATT_SUCCESS, STATE_CONNECTED, STATE_DISCONNECTED,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn status(ok: bool) -> i32 {
    if ok {
        GATT_SUCCESS
    } else {
        GATT_FAILURE
    }
}

fn to_gatt(characteristic: &Characteristic) -> GattCharacteristic {
    GattCharacteristic {
        uuid: characteristic.uuid,
        value: Vec::new(),
        permissions: 0,
        properties: u32::from(characteristic.properties.bits()),
        descriptors: characteristic
            .descriptors
            .iter()
            .map(|d| GattDescriptor::new(d.uuid, Vec::new()))
            .collect(),
    }
}

// ----------------------------------------------------------------------------
// Shared Driver State
// ----------------------------------------------------------------------------

#[derive(Clone)]
struct Shared {
    adapter: Adapter,
    events: broadcast::Sender<DriverEvent>,
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    scans: Arc<RwLock<HashMap<String, ScanFilter>>>,
    listening: Arc<Mutex<HashSet<String>>>,
    connect_timeout: Duration,
}

impl Shared {
    fn emit(&self, event: DriverEvent) {
        // no subscribers is not an error
        let _ = self.events.send(event);
    }

    async fn peripheral(&self, address: &str) -> Result<Peripheral> {
        if let Some(p) = self.peripherals.read().await.get(&address.to_uppercase()) {
            return Ok(p.clone());
        }
        let peripherals = self.adapter.peripherals().await?;
        for p in peripherals {
            if p.address().to_string().eq_ignore_ascii_case(address) {
                self.peripherals
                    .write()
                    .await
                    .insert(address.to_uppercase(), p.clone());
                return Ok(p);
            }
        }
        Err(BleDriverError::DeviceNotFound {
            address: address.to_string(),
        })
    }

    async fn characteristic(&self, address: &str, uuid: Uuid) -> Result<(Peripheral, Characteristic)> {
        let p = self.peripheral(address).await?;
        let c = p
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| BleDriverError::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })?;
        Ok((p, c))
    }

    /// Run an operation in the background, reporting unexpected failures
    fn spawn<F>(&self, address: &str, operation: &'static str, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let shared = self.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                warn!("BLE {} on {} failed: {}", operation, address, e);
                shared.emit(DriverEvent::OperationFailed {
                    address: Some(address),
                    reason: e.reason(),
                    message: e.to_string(),
                });
            }
        });
    }

    async fn found_device(&self, id: &PeripheralId) -> Option<FoundDevice> {
        let peripheral = self.adapter.peripheral(id).await.ok()?;
        let properties = peripheral.properties().await.ok()??;
        let address = properties.address.to_string().to_uppercase();
        self.peripherals
            .write()
            .await
            .insert(address.clone(), peripheral);

        let mut manufacturer_data: Vec<ManufacturerData> = properties
            .manufacturer_data
            .into_iter()
            .map(|(company_id, data)| ManufacturerData { company_id, data })
            .collect();
        manufacturer_data.sort_by_key(|m| m.company_id);
        Some(FoundDevice {
            address,
            name: properties.local_name,
            rssi: properties.rssi,
            manufacturer_data,
            services: properties.services,
        })
    }

    async fn on_central_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                if self.scans.read().await.is_empty() {
                    return;
                }
                let Some(found) = self.found_device(&id).await else {
                    return;
                };
                let wanted = self.scans.read().await.values().any(|f| f.matches(&found));
                if wanted {
                    debug!("Advertisement from {}", found.address);
                    self.emit(DriverEvent::DeviceFound(found));
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let address = self
                    .peripherals
                    .read()
                    .await
                    .iter()
                    .find(|(_, p)| p.id() == id)
                    .map(|(a, _)| a.clone());
                if let Some(address) = address {
                    debug!("{} dropped its connection", address);
                    self.emit(DriverEvent::ConnectionStateChange {
                        address,
                        status: GATT_SUCCESS,
                        state: STATE_DISCONNECTED,
                    });
                }
            }
            _ => {}
        }
    }

    async fn forward_notifications(&self, address: &str, peripheral: &Peripheral) -> Result<()> {
        if !self.listening.lock().await.insert(address.to_string()) {
            return Ok(());
        }
        let mut notifications = peripheral.notifications().await?;
        let shared = self.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                shared.emit(DriverEvent::CharacteristicChanged {
                    address: address.clone(),
                    characteristic: GattCharacteristic::new(n.uuid).with_value(n.value),
                });
            }
            shared.listening.lock().await.remove(&address);
            debug!("Notification stream for {} ended", address);
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Local Driver
// ----------------------------------------------------------------------------

/// Driver for the first BLE adapter of this host
pub struct LocalBleDriver {
    shared: Shared,
}

impl LocalBleDriver {
    /// Initialize the first available adapter
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleDriverError::Adapter(format!("Failed to create BLE manager: {e}")))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| BleDriverError::Adapter(format!("Failed to get BLE adapters: {e}")))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(BleDriverError::AdapterNotAvailable)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Shared {
            adapter,
            events,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            scans: Arc::new(RwLock::new(HashMap::new())),
            listening: Arc::new(Mutex::new(HashSet::new())),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        };

        let mut central = shared.adapter.events().await?;
        let listener = shared.clone();
        tokio::spawn(async move {
            while let Some(event) = central.next().await {
                listener.on_central_event(event).await;
            }
            error!("BLE adapter event stream ended");
        });

        info!("BLE adapter initialized");
        Ok(Self { shared })
    }

    /// Set how long a GATT connect may take
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.shared.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl BleDriver for LocalBleDriver {
    fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.shared.events.subscribe()
    }

    async fn start_scan(&self, scan_id: &str, filter: ScanFilter) -> Result<()> {
        let window = filter.timeout();
        let first = {
            let mut scans = self.shared.scans.write().await;
            scans.insert(scan_id.to_string(), filter);
            scans.len() == 1
        };
        if first {
            if let Err(e) = self.shared.adapter.start_scan(AdapterScanFilter::default()).await {
                self.shared.scans.write().await.remove(scan_id);
                self.shared.emit(DriverEvent::ScanStarted {
                    scan_id: scan_id.to_string(),
                    status: GATT_FAILURE,
                });
                return Err(BleDriverError::Adapter(format!("Failed to start BLE scan: {e}")));
            }
            info!("Started BLE scanning");
        }
        self.shared.emit(DriverEvent::ScanStarted {
            scan_id: scan_id.to_string(),
            status: GATT_SUCCESS,
        });

        if let Some(window) = window {
            let shared = self.shared.clone();
            let scan_id = scan_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let (removed, idle) = {
                    let mut scans = shared.scans.write().await;
                    (scans.remove(&scan_id).is_some(), scans.is_empty())
                };
                if removed {
                    if idle {
                        if let Err(e) = shared.adapter.stop_scan().await {
                            warn!("Failed to stop BLE scan: {}", e);
                        }
                    }
                    shared.emit(DriverEvent::ScanCompleted { scan_id });
                }
            });
        }
        Ok(())
    }

    async fn stop_scan(&self, scan_id: &str) -> Result<()> {
        let idle = {
            let mut scans = self.shared.scans.write().await;
            scans.remove(scan_id).is_some() && scans.is_empty()
        };
        if idle {
            self.shared
                .adapter
                .stop_scan()
                .await
                .map_err(|e| BleDriverError::Adapter(format!("Failed to stop BLE scan: {e}")))?;
            info!("Stopped BLE scanning");
        }
        Ok(())
    }

    async fn connect_gatt(&self, address: &str) -> Result<()> {
        let shared = self.shared.clone();
        let target = address.to_string();
        self.shared.spawn(address, "connect", async move {
            let peripheral = shared.peripheral(&target).await?;
            let connected = match timeout(shared.connect_timeout, peripheral.connect()).await {
                Ok(Ok(())) => {
                    info!("Connected to {}", target);
                    true
                }
                Ok(Err(e)) => {
                    warn!("Failed to connect to {}: {}", target, e);
                    false
                }
                Err(_) => {
                    warn!("Connection to {} timed out", target);
                    false
                }
            };
            shared.emit(DriverEvent::ConnectionStateChange {
                address: target,
                status: status(connected),
                state: if connected {
                    STATE_CONNECTED
                } else {
                    STATE_DISCONNECTED
                },
            });
            Ok(())
        });
        Ok(())
    }

    async fn close_gatt(&self, address: &str) -> Result<()> {
        let shared = self.shared.clone();
        let target = address.to_string();
        self.shared.spawn(address, "close", async move {
            if let Ok(peripheral) = shared.peripheral(&target).await {
                if peripheral.is_connected().await.unwrap_or(false) {
                    if let Err(e) = peripheral.disconnect().await {
                        warn!("Failed to disconnect from {}: {}", target, e);
                    }
                }
            }
            shared.emit(DriverEvent::ConnectionStateChange {
                address: target.clone(),
                status: GATT_SUCCESS,
                state: STATE_DISCONNECTED,
            });
            shared.emit(DriverEvent::GattRelease { address: target });
            Ok(())
        });
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<()> {
        let shared = self.shared.clone();
        let target = address.to_string();
        self.shared.spawn(address, "service discovery", async move {
            let peripheral = shared.peripheral(&target).await?;
            let result = peripheral.discover_services().await;
            let services = peripheral
                .services()
                .iter()
                .map(|s| GattService {
                    uuid: s.uuid,
                    characteristics: s.characteristics.iter().map(to_gatt).collect(),
                })
                .collect();
            if let Err(e) = &result {
                warn!("Service discovery on {} failed: {}", target, e);
            }
            shared.emit(DriverEvent::Services {
                address: target,
                status: status(result.is_ok()),
                services,
            });
            Ok(())
        });
        Ok(())
    }

    async fn enable_notifications(
        &self,
        address: &str,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<()> {
        let shared = self.shared.clone();
        let target = address.to_string();
        self.shared.spawn(address, "notification setup", async move {
            let (peripheral, c) = shared.characteristic(&target, characteristic).await?;
            let result = if enable {
                shared.forward_notifications(&target, &peripheral).await?;
                peripheral.subscribe(&c).await
            } else {
                peripheral.unsubscribe(&c).await
            };
            let value = if enable { vec![0x01, 0x00] } else { vec![0x00, 0x00] };
            shared.emit(DriverEvent::DescriptorWrite {
                address: target,
                status: status(result.is_ok()),
                descriptor: GattDescriptor::new(CCCD_UUID, value),
            });
            Ok(())
        });
        Ok(())
    }

    async fn read_characteristic(&self, address: &str, characteristic: Uuid) -> Result<()> {
        let shared = self.shared.clone();
        let target = address.to_string();
        self.shared.spawn(address, "read", async move {
            let (peripheral, c) = shared.characteristic(&target, characteristic).await?;
            let (ok, value) = match peripheral.read(&c).await {
                Ok(value) => (true, value),
                Err(e) => {
                    warn!("Read of {} on {} failed: {}", characteristic, target, e);
                    (false, Vec::new())
                }
            };
            shared.emit(DriverEvent::CharacteristicRead {
                address: target,
                status: status(ok),
                characteristic: to_gatt(&c).with_value(value),
            });
            Ok(())
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        address: &str,
        characteristic: GattCharacteristic,
    ) -> Result<()> {
        let shared = self.shared.clone();
        let target = address.to_string();
        self.shared.spawn(address, "write", async move {
            let (peripheral, c) = shared.characteristic(&target, characteristic.uuid).await?;
            let result = peripheral
                .write(&c, &characteristic.value, WriteType::WithResponse)
                .await;
            shared.emit(DriverEvent::CharacteristicWrite {
                address: target,
                status: status(result.is_ok()),
                characteristic,
            });
            Ok(())
        });
        Ok(())
    }

    async fn write_descriptor(
        &self,
        address: &str,
        characteristic: Uuid,
        descriptor: GattDescriptor,
    ) -> Result<()> {
        let shared = self.shared.clone();
        let target = address.to_string();
        self.shared.spawn(address, "descriptor write", async move {
            let (peripheral, c) = shared.characteristic(&target, characteristic).await?;
            let d = c
                .descriptors
                .iter()
                .find(|d| d.uuid == descriptor.uuid)
                .ok_or_else(|| BleDriverError::DescriptorNotFound {
                    uuid: descriptor.uuid.to_string(),
                })?;
            let result = peripheral.write_descriptor(d, &descriptor.value).await;
            shared.emit(DriverEvent::DescriptorWrite {
                address: target,
                status: status(result.is_ok()),
                descriptor,
            });
            Ok(())
        });
        Ok(())
    }
}
