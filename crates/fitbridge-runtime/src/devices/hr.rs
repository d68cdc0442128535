//! Bluetooth heart-rate profile sensors

use fitbridge_ble::{uuid16, FoundDevice, GattCharacteristic, ScanFilter};
use fitbridge_core::{Derivator, DerivatorConfig, HeartRateDerivator, HrDeviceOutput, Sample};
use tracing::debug;
use uuid::Uuid;

use super::{ConnectStrategy, DeviceInfo, DeviceKind};

pub const HEART_RATE_SERVICE: Uuid = uuid16(0x180D);
pub const HEART_RATE_MEASUREMENT: Uuid = uuid16(0x2A37);
pub const BATTERY_LEVEL: Uuid = uuid16(0x2A19);
pub const MANUFACTURER_NAME: Uuid = uuid16(0x2A29);

const READS: [Uuid; 2] = [BATTERY_LEVEL, MANUFACTURER_NAME];
const NOTIFIES: [Uuid; 1] = [HEART_RATE_MEASUREMENT];

// measurement flag bits
const FLAG_HR_U16: u8 = 0x01;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;
const FLAG_ENERGY: u8 = 0x08;
const FLAG_RR: u8 = 0x10;

/// Decode a Heart Rate Measurement value
///
/// `worn` is 1 or 0 when the sensor reports skin contact and -1 when it
/// cannot tell; `joule` is -1 when no energy field is present. RR intervals
/// arrive in 1/1024 s and are converted to milliseconds.
pub fn parse_heart_rate(value: &[u8]) -> Option<HrDeviceOutput> {
    let (&flags, mut rest) = value.split_first()?;

    let pulse = if flags & FLAG_HR_U16 != 0 {
        take_u16(&mut rest)?
    } else {
        let (&b, tail) = rest.split_first()?;
        rest = tail;
        b as i64
    };

    let worn = if flags & FLAG_CONTACT_SUPPORTED == 0 {
        -1
    } else if flags & FLAG_CONTACT_DETECTED != 0 {
        1
    } else {
        0
    };

    let joule = if flags & FLAG_ENERGY != 0 {
        take_u16(&mut rest)?
    } else {
        -1
    };

    let mut output = HrDeviceOutput::new(pulse, worn, joule);
    if flags & FLAG_RR != 0 {
        while let Some(rr) = take_u16(&mut rest) {
            output.rr.push((rr * 1000 + 512) / 1024);
        }
    }
    Some(output)
}

fn take_u16(rest: &mut &[u8]) -> Option<i64> {
    if rest.len() < 2 {
        return None;
    }
    let value = u16::from_le_bytes([rest[0], rest[1]]);
    *rest = &rest[2..];
    Some(value as i64)
}

// ----------------------------------------------------------------------------
// Kind
// ----------------------------------------------------------------------------

/// `hrdevice`: any sensor exposing the standard heart-rate service
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartRateKind;

impl DeviceKind for HeartRateKind {
    fn tag(&self) -> &'static str {
        "hrdevice"
    }

    fn strategy(&self) -> ConnectStrategy {
        ConnectStrategy::Gatt
    }

    fn search_filter(&self) -> ScanFilter {
        ScanFilter::default().with_service(HEART_RATE_SERVICE)
    }

    fn recognizes(&self, found: &FoundDevice) -> bool {
        found.services.contains(&HEART_RATE_SERVICE)
    }

    fn read_characteristics(&self) -> &'static [Uuid] {
        &READS
    }

    fn notify_characteristics(&self) -> &'static [Uuid] {
        &NOTIFIES
    }

    fn parse_notification(&self, characteristic: &GattCharacteristic) -> Option<Sample> {
        if characteristic.uuid != HEART_RATE_MEASUREMENT {
            return None;
        }
        let parsed = parse_heart_rate(&characteristic.value);
        if parsed.is_none() {
            debug!("Short heart-rate measurement {:02x?}", characteristic.value);
        }
        parsed.map(Sample::Hr)
    }

    fn parse_read(&self, characteristic: &GattCharacteristic, info: &mut DeviceInfo) {
        if characteristic.uuid == BATTERY_LEVEL {
            info.battery = characteristic.value.first().map(|b| *b as i64);
        } else if characteristic.uuid == MANUFACTURER_NAME {
            let name = String::from_utf8_lossy(&characteristic.value);
            info.manufacturer = Some(name.trim_end_matches('\0').to_string());
        }
    }

    fn decorate(&self, sample: &mut Sample, info: &DeviceInfo) {
        if let Sample::Hr(hr) = sample {
            hr.battery = info.battery.unwrap_or(-1);
        }
    }

    fn derivator(&self, config: &DerivatorConfig) -> Box<dyn Derivator> {
        Box::new(HeartRateDerivator::new(config))
    }

    fn notification_priority(&self) -> i32 {
        1
    }

    fn notification_text(&self, alias: &str, sample: &Sample) -> Option<String> {
        match sample {
            Sample::Hr(hr) => Some(format!("{alias}: {} bpm", hr.pulse)),
            _ => None,
        }
    }
}
