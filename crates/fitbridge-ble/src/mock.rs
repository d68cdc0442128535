//! Scripted in-memory driver for tests
//!
//! Records every call and, unless switched to manual mode, answers each call
//! immediately with the event a well-behaved device would produce.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::driver::{BleDriver, DriverCall, EVENT_CAPACITY};
use crate::error::{BleDriverError, Result};
use crate::types::{
    DriverEvent, FoundDevice, GattCharacteristic, GattDescriptor, GattService, ScanFilter,
    CCCD_UUID, GATT_FAILURE, GATT_SUCCESS, STATE_CONNECTED, STATE_DISCONNECTED,
};

#[derive(Default)]
struct MockState {
    calls: Vec<DriverCall>,
    manual: bool,
    adapter_off: bool,
    scans: HashMap<String, ScanFilter>,
    connected: HashSet<String>,
    connect_failures: HashMap<String, u32>,
    services: HashMap<String, Vec<GattService>>,
    reads: HashMap<(String, Uuid), Vec<u8>>,
    advertisements: Vec<FoundDevice>,
}

/// Cloneable handle; clones share the same script and call log
#[derive(Clone)]
pub struct MockDriver {
    events: broadcast::Sender<DriverEvent>,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Record calls without answering them
    pub fn manual() -> Self {
        let mock = Self::new();
        mock.lock().manual = true;
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // poisoned only by a panicking test thread
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_services(self, address: &str, services: Vec<GattService>) -> Self {
        self.lock().services.insert(address.to_string(), services);
        self
    }

    pub fn with_read_value(self, address: &str, characteristic: Uuid, value: Vec<u8>) -> Self {
        self.lock()
            .reads
            .insert((address.to_string(), characteristic), value);
        self
    }

    /// Report `found` right after every answered scan whose filter matches it
    pub fn with_advertisement(self, found: FoundDevice) -> Self {
        self.lock().advertisements.push(found);
        self
    }

    /// Make the next `count` connects to `address` fail
    pub fn fail_connects(&self, address: &str, count: u32) {
        self.lock()
            .connect_failures
            .insert(address.to_string(), count);
    }

    /// Refuse every call as if the radio were off
    pub fn set_adapter_available(&self, available: bool) {
        self.lock().adapter_off = !available;
    }

    /// Inject an event as if the hardware produced it
    pub fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<DriverCall> {
        std::mem::take(&mut self.lock().calls)
    }

    pub fn is_scanning(&self, scan_id: &str) -> bool {
        self.lock().scans.contains_key(scan_id)
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.lock().connected.contains(address)
    }

    pub fn connect_count(&self, address: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, DriverCall::ConnectGatt { address: a } if a == address))
            .count()
    }

    /// Log a call, returning whether the mock should answer it
    fn record(&self, call: DriverCall) -> Result<bool> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.adapter_off {
            return Err(BleDriverError::AdapterNotAvailable);
        }
        Ok(!state.manual)
    }
}

#[async_trait]
impl BleDriver for MockDriver {
    fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    async fn start_scan(&self, scan_id: &str, filter: ScanFilter) -> Result<()> {
        let answer = self.record(DriverCall::StartScan {
            scan_id: scan_id.to_string(),
            filter: filter.clone(),
        })?;
        let seen: Vec<FoundDevice> = {
            let mut state = self.lock();
            state.scans.insert(scan_id.to_string(), filter.clone());
            state
                .advertisements
                .iter()
                .filter(|found| filter.matches(found))
                .cloned()
                .collect()
        };
        if answer {
            self.emit(DriverEvent::ScanStarted {
                scan_id: scan_id.to_string(),
                status: GATT_SUCCESS,
            });
            for found in seen {
                self.emit(DriverEvent::DeviceFound(found));
            }
        }
        Ok(())
    }

    async fn stop_scan(&self, scan_id: &str) -> Result<()> {
        self.record(DriverCall::StopScan {
            scan_id: scan_id.to_string(),
        })?;
        self.lock().scans.remove(scan_id);
        Ok(())
    }

    async fn connect_gatt(&self, address: &str) -> Result<()> {
        if !self.record(DriverCall::ConnectGatt {
            address: address.to_string(),
        })? {
            return Ok(());
        }
        let failed = {
            let mut state = self.lock();
            match state.connect_failures.get_mut(address) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => {
                    state.connected.insert(address.to_string());
                    false
                }
            }
        };
        self.emit(DriverEvent::ConnectionStateChange {
            address: address.to_string(),
            status: if failed { GATT_FAILURE } else { GATT_SUCCESS },
            state: if failed {
                STATE_DISCONNECTED
            } else {
                STATE_CONNECTED
            },
        });
        Ok(())
    }

    async fn close_gatt(&self, address: &str) -> Result<()> {
        let answer = self.record(DriverCall::CloseGatt {
            address: address.to_string(),
        })?;
        self.lock().connected.remove(address);
        if answer {
            self.emit(DriverEvent::ConnectionStateChange {
                address: address.to_string(),
                status: GATT_SUCCESS,
                state: STATE_DISCONNECTED,
            });
            self.emit(DriverEvent::GattRelease {
                address: address.to_string(),
            });
        }
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<()> {
        if self.record(DriverCall::DiscoverServices {
            address: address.to_string(),
        })? {
            let services = self.lock().services.get(address).cloned().unwrap_or_default();
            self.emit(DriverEvent::Services {
                address: address.to_string(),
                status: GATT_SUCCESS,
                services,
            });
        }
        Ok(())
    }

    async fn enable_notifications(
        &self,
        address: &str,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<()> {
        if self.record(DriverCall::EnableNotifications {
            address: address.to_string(),
            characteristic,
            enable,
        })? {
            let value = if enable { vec![0x01, 0x00] } else { vec![0x00, 0x00] };
            self.emit(DriverEvent::DescriptorWrite {
                address: address.to_string(),
                status: GATT_SUCCESS,
                descriptor: GattDescriptor::new(CCCD_UUID, value),
            });
        }
        Ok(())
    }

    async fn read_characteristic(&self, address: &str, characteristic: Uuid) -> Result<()> {
        if self.record(DriverCall::ReadCharacteristic {
            address: address.to_string(),
            characteristic,
        })? {
            let value = self
                .lock()
                .reads
                .get(&(address.to_string(), characteristic))
                .cloned();
            self.emit(DriverEvent::CharacteristicRead {
                address: address.to_string(),
                status: if value.is_some() { GATT_SUCCESS } else { GATT_FAILURE },
                characteristic: GattCharacteristic::new(characteristic)
                    .with_value(value.unwrap_or_default()),
            });
        }
        Ok(())
    }

    async fn write_characteristic(
        &self,
        address: &str,
        characteristic: GattCharacteristic,
    ) -> Result<()> {
        if self.record(DriverCall::WriteCharacteristic {
            address: address.to_string(),
            characteristic: characteristic.clone(),
        })? {
            self.emit(DriverEvent::CharacteristicWrite {
                address: address.to_string(),
                status: GATT_SUCCESS,
                characteristic,
            });
        }
        Ok(())
    }

    async fn write_descriptor(
        &self,
        address: &str,
        characteristic: Uuid,
        descriptor: GattDescriptor,
    ) -> Result<()> {
        if self.record(DriverCall::WriteDescriptor {
            address: address.to_string(),
            characteristic,
            descriptor: descriptor.clone(),
        })? {
            self.emit(DriverEvent::DescriptorWrite {
                address: address.to_string(),
                status: GATT_SUCCESS,
                descriptor,
            });
        }
        Ok(())
    }
}
