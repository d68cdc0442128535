//! Keiser M3i spin bikes
//!
//! The bike never accepts connections; it broadcasts its console values in
//! the manufacturer data of every advertisement.

use fitbridge_ble::{FoundDevice, ScanFilter};
use fitbridge_core::{Derivator, DerivatorConfig, KeiserDerivator, KeiserM3iOutput, Sample};
use tracing::trace;

use super::{ConnectStrategy, DeviceKind};

pub const KEISER_COMPANY_ID: u16 = 0x0102;

const MIN_LEN: usize = 4;
const MAX_LEN: usize = 19;

/// Decode Keiser manufacturer data
///
/// Layout after an optional `02 01` prefix: major, minor, data type,
/// equipment id, then big-endian u16 rpm, pulse, watt and calories (all
/// tenths as sent), minutes, seconds, u16 distance and an optional gear.
/// Payloads outside 4..=19 bytes are rejected; fields cut off by a short
/// payload read as zero.
pub fn parse_keiser(data: &[u8]) -> Option<KeiserM3iOutput> {
    if !(MIN_LEN..=MAX_LEN).contains(&data.len()) {
        trace!("Keiser payload of {} bytes ignored", data.len());
        return None;
    }
    let body = match data {
        [0x02, 0x01, rest @ ..] if rest.len() >= MIN_LEN => rest,
        _ => data,
    };

    let byte = |i: usize| body.get(i).copied().map(i64::from).unwrap_or(0);
    let word = |i: usize| byte(i) << 8 | byte(i + 1);

    Some(KeiserM3iOutput {
        major: byte(0),
        minor: byte(1),
        equipment_id: byte(3),
        rpm: word(4),
        pulse: word(6),
        watt: word(8),
        calorie: word(10),
        time: byte(12) * 60 + byte(13),
        distance_raw: word(14),
        gear: body.get(16).map(|g| *g as i64),
        ..KeiserM3iOutput::default()
    })
}

/// `keiserm3i`: advertisement-only bikes
#[derive(Debug, Clone, Copy, Default)]
pub struct KeiserKind;

impl DeviceKind for KeiserKind {
    fn tag(&self) -> &'static str {
        "keiserm3i"
    }

    fn strategy(&self) -> ConnectStrategy {
        ConnectStrategy::Advertisement
    }

    fn search_filter(&self) -> ScanFilter {
        ScanFilter::default().with_manufacturer(KEISER_COMPANY_ID)
    }

    fn connect_filter(&self, address: &str) -> ScanFilter {
        self.search_filter().with_address(address)
    }

    fn recognizes(&self, found: &FoundDevice) -> bool {
        found.manufacturer(KEISER_COMPANY_ID).is_some()
    }

    fn parse_advertisement(&self, found: &FoundDevice) -> Option<Sample> {
        found
            .manufacturer(KEISER_COMPANY_ID)
            .and_then(parse_keiser)
            .map(Sample::Keiser)
    }

    fn derivator(&self, config: &DerivatorConfig) -> Box<dyn Derivator> {
        Box::new(KeiserDerivator::new(config))
    }

    fn notification_priority(&self) -> i32 {
        2
    }

    fn notification_text(&self, alias: &str, sample: &Sample) -> Option<String> {
        match sample {
            Sample::Keiser(k) => Some(format!(
                "{alias}: {} rpm {} W {:.2} km",
                k.rpm, k.watt, k.distance
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitbridge_core::derivator::keiser_distance_km;
    use fitbridge_core::{MockTimeSource, TimeSource};

    const CONSOLE: [u8; 16] = [
        0x06, 0x21, 0x00, 0x03, 0x00, 0x12, 0x00, 0x96, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0A, 0x00,
        0x28,
    ];

    #[test]
    fn test_console_broadcast() {
        let k = parse_keiser(&CONSOLE).unwrap();
        assert_eq!((k.major, k.minor, k.equipment_id), (6, 0x21, 3));
        assert_eq!((k.rpm, k.pulse, k.watt, k.calorie), (18, 150, 0, 0));
        assert_eq!(k.time, 10);
        assert_eq!(k.distance_raw, 0x28);
        assert_eq!(k.gear, None);
    }

    #[test]
    fn test_prefix_and_gear() {
        let mut data = vec![0x02, 0x01];
        data.extend_from_slice(&CONSOLE);
        data.push(12);
        let k = parse_keiser(&data).unwrap();
        assert_eq!(k.rpm, 18);
        assert_eq!(k.gear, Some(12));
    }

    #[test]
    fn test_length_bounds() {
        assert!(parse_keiser(&CONSOLE[..3]).is_none());
        assert!(parse_keiser(&[0u8; 20]).is_none());
        let short = parse_keiser(&CONSOLE[..4]).unwrap();
        assert_eq!((short.major, short.rpm, short.time), (6, 0, 0));
    }

    #[test]
    fn test_derived_console_values() {
        let kind = KeiserKind;
        let found = FoundDevice::new("C0:FF:EE:00:00:01")
            .with_manufacturer_data(KEISER_COMPANY_ID, CONSOLE.to_vec());
        assert!(kind.recognizes(&found));

        let mut sample = kind.parse_advertisement(&found).unwrap();
        let mut derivator = kind.derivator(&DerivatorConfig::default());
        let clock = MockTimeSource::new_at(1_000);
        derivator.step(&mut sample, clock.now_ms());
        let Sample::Keiser(k) = sample else {
            panic!("expected a keiser sample");
        };
        assert_eq!(k.rpm, 1);
        assert!((k.rpm_mean - 1.8).abs() < 1e-9);
        assert_eq!(k.pulse, 15);
        assert_eq!(k.time, 10);
        assert!((k.distance - keiser_distance_km(40)).abs() < 1e-9);
        assert!((k.distance - 40.0 * 0.1 * 1.60934).abs() < 1e-9);
    }

    #[test]
    fn test_other_vendors_are_not_bikes() {
        let found = FoundDevice::new("C0:FF:EE:00:00:02").with_manufacturer_data(0x004C, vec![1, 2]);
        assert!(!KeiserKind.recognizes(&found));
        assert!(KeiserKind.parse_advertisement(&found).is_none());
    }
}
