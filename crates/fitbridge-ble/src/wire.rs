//! Driver calls and events as OSC messages
//!
//! Scan calls and scan events are scoped to the scan id; everything else
//! leads with the device address. GATT attributes travel as JSON strings.

use fitbridge_core::DisconnectReason;
use fitbridge_osc::address::wbd;
use fitbridge_osc::{Arg, Delivery};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::driver::DriverCall;
use crate::error::{BleDriverError, Result};
use crate::types::DriverEvent;

/// Address, optional uid scope and arguments of one message
pub type Wire = (&'static str, Option<String>, Vec<Arg>);

// ----------------------------------------------------------------------------
// Argument Helpers
// ----------------------------------------------------------------------------

fn json<T: Serialize>(value: &T) -> Result<Arg> {
    Ok(Arg::Str(serde_json::to_string(value)?))
}

struct Args<'a> {
    address: &'a str,
    args: &'a [Arg],
}

impl<'a> Args<'a> {
    fn of(delivery: &'a Delivery) -> Self {
        Self {
            address: &delivery.address,
            args: &delivery.args,
        }
    }

    fn missing(&self, index: usize, what: &str) -> BleDriverError {
        BleDriverError::Protocol(format!("{}: argument {} ({}) missing", self.address, index, what))
    }

    fn str(&self, index: usize) -> Result<String> {
        self.args
            .get(index)
            .and_then(Arg::as_str)
            .map(str::to_string)
            .ok_or_else(|| self.missing(index, "string"))
    }

    fn int(&self, index: usize) -> Result<i32> {
        self.args
            .get(index)
            .and_then(Arg::as_i64)
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| self.missing(index, "int"))
    }

    fn flag(&self, index: usize) -> Result<bool> {
        self.args
            .get(index)
            .and_then(Arg::as_bool)
            .ok_or_else(|| self.missing(index, "bool"))
    }

    fn uuid(&self, index: usize) -> Result<Uuid> {
        Uuid::parse_str(&self.str(index)?)
            .map_err(|e| BleDriverError::Protocol(format!("{}: bad uuid: {e}", self.address)))
    }

    fn json<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        Ok(serde_json::from_str(&self.str(index)?)?)
    }
}

fn scope(delivery: &Delivery) -> Result<String> {
    delivery
        .uid
        .clone()
        .ok_or_else(|| BleDriverError::Protocol(format!("{} carries no scan id", delivery.address)))
}

// ----------------------------------------------------------------------------
// Calls
// ----------------------------------------------------------------------------

pub fn encode_call(call: &DriverCall) -> Result<Wire> {
    Ok(match call {
        DriverCall::StartScan { scan_id, filter } => {
            (wbd::START_SCAN, Some(scan_id.clone()), vec![json(filter)?])
        }
        DriverCall::StopScan { scan_id } => (wbd::STOP_SCAN, Some(scan_id.clone()), vec![]),
        DriverCall::ConnectGatt { address } => (wbd::CONNECT_GATT, None, vec![address.as_str().into()]),
        DriverCall::CloseGatt { address } => (wbd::CLOSE_GATT, None, vec![address.as_str().into()]),
        DriverCall::DiscoverServices { address } => {
            (wbd::DISCOVER_SERVICES, None, vec![address.as_str().into()])
        }
        DriverCall::EnableNotifications {
            address,
            characteristic,
            enable,
        } => (
            wbd::ENABLE_NOTIFICATIONS,
            None,
            vec![
                address.as_str().into(),
                characteristic.to_string().into(),
                Arg::Bool(*enable),
            ],
        ),
        DriverCall::ReadCharacteristic {
            address,
            characteristic,
        } => (
            wbd::READ_CHARACTERISTIC,
            None,
            vec![address.as_str().into(), characteristic.to_string().into()],
        ),
        DriverCall::WriteCharacteristic {
            address,
            characteristic,
        } => (
            wbd::WRITE_CHARACTERISTIC,
            None,
            vec![address.as_str().into(), json(characteristic)?],
        ),
        DriverCall::WriteDescriptor {
            address,
            characteristic,
            descriptor,
        } => (
            wbd::WRITE_DESCRIPTOR,
            None,
            vec![
                address.as_str().into(),
                characteristic.to_string().into(),
                json(descriptor)?,
            ],
        ),
    })
}

pub fn decode_call(delivery: &Delivery) -> Result<DriverCall> {
    let a = Args::of(delivery);
    Ok(match delivery.address.as_str() {
        wbd::START_SCAN => DriverCall::StartScan {
            scan_id: scope(delivery)?,
            filter: a.json(0)?,
        },
        wbd::STOP_SCAN => DriverCall::StopScan {
            scan_id: scope(delivery)?,
        },
        wbd::CONNECT_GATT => DriverCall::ConnectGatt { address: a.str(0)? },
        wbd::CLOSE_GATT => DriverCall::CloseGatt { address: a.str(0)? },
        wbd::DISCOVER_SERVICES => DriverCall::DiscoverServices { address: a.str(0)? },
        wbd::ENABLE_NOTIFICATIONS => DriverCall::EnableNotifications {
            address: a.str(0)?,
            characteristic: a.uuid(1)?,
            enable: a.flag(2)?,
        },
        wbd::READ_CHARACTERISTIC => DriverCall::ReadCharacteristic {
            address: a.str(0)?,
            characteristic: a.uuid(1)?,
        },
        wbd::WRITE_CHARACTERISTIC => DriverCall::WriteCharacteristic {
            address: a.str(0)?,
            characteristic: a.json(1)?,
        },
        wbd::WRITE_DESCRIPTOR => DriverCall::WriteDescriptor {
            address: a.str(0)?,
            characteristic: a.uuid(1)?,
            descriptor: a.json(2)?,
        },
        other => return Err(BleDriverError::Protocol(format!("unknown driver call {other}"))),
    })
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

pub fn encode_event(event: &DriverEvent) -> Result<Wire> {
    Ok(match event {
        DriverEvent::DeviceFound(found) => (wbd::DEVICE_FOUND, None, vec![json(found)?]),
        DriverEvent::ConnectionStateChange {
            address,
            status,
            state,
        } => (
            wbd::CONNECTION_STATE_CHANGE,
            None,
            vec![address.as_str().into(), (*status).into(), (*state).into()],
        ),
        DriverEvent::Services {
            address,
            status,
            services,
        } => (
            wbd::SERVICES,
            None,
            vec![address.as_str().into(), (*status).into(), json(services)?],
        ),
        DriverEvent::CharacteristicChanged {
            address,
            characteristic,
        } => (
            wbd::CHARACTERISTIC_CHANGED,
            None,
            vec![address.as_str().into(), json(characteristic)?],
        ),
        DriverEvent::CharacteristicRead {
            address,
            status,
            characteristic,
        } => (
            wbd::CHARACTERISTIC_READ,
            None,
            vec![address.as_str().into(), (*status).into(), json(characteristic)?],
        ),
        DriverEvent::CharacteristicWrite {
            address,
            status,
            characteristic,
        } => (
            wbd::CHARACTERISTIC_WRITE,
            None,
            vec![address.as_str().into(), (*status).into(), json(characteristic)?],
        ),
        DriverEvent::DescriptorRead {
            address,
            status,
            descriptor,
        } => (
            wbd::DESCRIPTOR_READ,
            None,
            vec![address.as_str().into(), (*status).into(), json(descriptor)?],
        ),
        DriverEvent::DescriptorWrite {
            address,
            status,
            descriptor,
        } => (
            wbd::DESCRIPTOR_WRITE,
            None,
            vec![address.as_str().into(), (*status).into(), json(descriptor)?],
        ),
        DriverEvent::GattRelease { address } => {
            (wbd::GATT_RELEASE, None, vec![address.as_str().into()])
        }
        DriverEvent::ScanStarted { scan_id, status } => {
            (wbd::SCAN_STARTED, Some(scan_id.clone()), vec![(*status).into()])
        }
        DriverEvent::ScanCompleted { scan_id } => {
            (wbd::SCAN_COMPLETED, Some(scan_id.clone()), vec![])
        }
        DriverEvent::OperationFailed {
            address,
            reason,
            message,
        } => (
            wbd::OPERATION_FAILED,
            None,
            vec![
                address.clone().unwrap_or_default().into(),
                reason.code().into(),
                message.as_str().into(),
            ],
        ),
    })
}

pub fn decode_event(delivery: &Delivery) -> Result<DriverEvent> {
    let a = Args::of(delivery);
    Ok(match delivery.address.as_str() {
        wbd::DEVICE_FOUND => DriverEvent::DeviceFound(a.json(0)?),
        wbd::CONNECTION_STATE_CHANGE => DriverEvent::ConnectionStateChange {
            address: a.str(0)?,
            status: a.int(1)?,
            state: a.int(2)?,
        },
        wbd::SERVICES => DriverEvent::Services {
            address: a.str(0)?,
            status: a.int(1)?,
            services: a.json(2)?,
        },
        wbd::CHARACTERISTIC_CHANGED => DriverEvent::CharacteristicChanged {
            address: a.str(0)?,
            characteristic: a.json(1)?,
        },
        wbd::CHARACTERISTIC_READ => DriverEvent::CharacteristicRead {
            address: a.str(0)?,
            status: a.int(1)?,
            characteristic: a.json(2)?,
        },
        wbd::CHARACTERISTIC_WRITE => DriverEvent::CharacteristicWrite {
            address: a.str(0)?,
            status: a.int(1)?,
            characteristic: a.json(2)?,
        },
        wbd::DESCRIPTOR_READ => DriverEvent::DescriptorRead {
            address: a.str(0)?,
            status: a.int(1)?,
            descriptor: a.json(2)?,
        },
        wbd::DESCRIPTOR_WRITE => DriverEvent::DescriptorWrite {
            address: a.str(0)?,
            status: a.int(1)?,
            descriptor: a.json(2)?,
        },
        wbd::GATT_RELEASE => DriverEvent::GattRelease { address: a.str(0)? },
        wbd::SCAN_STARTED => DriverEvent::ScanStarted {
            scan_id: scope(delivery)?,
            status: a.int(0)?,
        },
        wbd::SCAN_COMPLETED => DriverEvent::ScanCompleted {
            scan_id: scope(delivery)?,
        },
        wbd::OPERATION_FAILED => {
            let address = a.str(0)?;
            DriverEvent::OperationFailed {
                address: (!address.is_empty()).then_some(address),
                reason: DisconnectReason::from_code(a.int(1)?)
                    .unwrap_or(DisconnectReason::OperationError),
                message: a.str(2).unwrap_or_default(),
            }
        }
        other => return Err(BleDriverError::Protocol(format!("unknown driver event {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{uuid16, GattCharacteristic, ScanFilter};

    /// What the receiving dispatcher hands over for a wire triple
    fn delivered((address, uid, args): Wire) -> Delivery {
        Delivery {
            address: address.to_string(),
            uid,
            args,
            timed_out: false,
        }
    }

    #[test]
    fn test_calls_survive_the_hop() {
        let calls = [
            DriverCall::StartScan {
                scan_id: "abcdefgh12345678".into(),
                filter: ScanFilter::default().with_address("AA:BB"),
            },
            DriverCall::EnableNotifications {
                address: "AA:BB".into(),
                characteristic: uuid16(0x2A37),
                enable: true,
            },
            DriverCall::WriteCharacteristic {
                address: "AA:BB".into(),
                characteristic: GattCharacteristic::new(uuid16(0x2A39)).with_value(vec![1]),
            },
        ];
        for call in calls {
            let back = decode_call(&delivered(encode_call(&call).unwrap())).unwrap();
            assert_eq!(back, call);
        }
    }

    #[test]
    fn test_events_survive_the_hop() {
        let events = [
            DriverEvent::ScanStarted {
                scan_id: "abcdefgh12345678".into(),
                status: 0,
            },
            DriverEvent::CharacteristicChanged {
                address: "AA:BB".into(),
                characteristic: GattCharacteristic::new(uuid16(0x2A37)).with_value(vec![0x16, 0x48]),
            },
            DriverEvent::OperationFailed {
                address: None,
                reason: DisconnectReason::BleDisabled,
                message: "off".into(),
            },
        ];
        for event in events {
            let back = decode_event(&delivered(encode_event(&event).unwrap())).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn test_missing_arguments_are_protocol_errors() {
        let d = Delivery {
            address: wbd::CONNECTION_STATE_CHANGE.into(),
            uid: None,
            args: vec![Arg::from("AA:BB")],
            timed_out: false,
        };
        assert!(matches!(decode_event(&d), Err(BleDriverError::Protocol(_))));
    }
}
