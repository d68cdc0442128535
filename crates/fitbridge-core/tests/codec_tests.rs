//! Tagged-string round trips for every registered entity

use fitbridge_core::codec::{deserialize, serialize};
use fitbridge_core::{
    Database, Device, HrDeviceOutput, KeiserM3iOutput, Label, Record, Session, User, View,
};
use proptest::prelude::*;
use serde_json::json;

fn roundtrip(record: Record) {
    let wire = serialize(&record).unwrap();
    assert_eq!(deserialize(&wire).unwrap(), record, "wire: {wire}");
}

#[test]
fn test_all_entities_roundtrip() {
    let mut device = Device::new("keiserm3i", "F0:F0:F0:F0:F0:F0").with_alias("bike_2");
    device.additional_settings.insert("machine".into(), json!(12));
    roundtrip(Record::Device(device));

    let mut user = User::new("Zoë");
    user.weight = 61;
    user.male = false;
    roundtrip(Record::User(user));

    let mut session = Session::new(1, 2, 1_700_000_000_000);
    session.main_id = Some(5);
    roundtrip(Record::Session(session));

    let mut hr = HrDeviceOutput::new(120, 1, 33);
    hr.rr = vec![500, 498];
    hr.joule_mean = Some(20.5);
    roundtrip(Record::HrDeviceOutput(hr));

    let keiser = KeiserM3iOutput {
        rpm: 85,
        gear: Some(12),
        distance: 3.25,
        ..KeiserM3iOutput::default()
    };
    roundtrip(Record::KeiserM3iOutput(keiser));

    roundtrip(Record::Label(Label::new(3, "state")));
}

#[test]
fn test_loaded_view_roundtrips() {
    let db = Database::open_in_memory().unwrap();
    db.bootstrap().unwrap();
    let mut device = Device::new("hrdevice", "AA").with_alias("hr");
    db.save(&mut device, true).unwrap();

    let mut view = View::new("dash");
    view.active = true;
    view.items.push(Label::new(device.id.unwrap(), "fitobj"));
    view.items.push(Label::new(device.id.unwrap(), "state"));
    db.save(&mut view, true).unwrap();

    let loaded: View = db.load_by_id(view.id.unwrap()).unwrap().unwrap();
    assert_eq!(loaded.connected_devices(), vec![device.id.unwrap()]);
    roundtrip(Record::View(loaded));
}

proptest! {
    #[test]
    fn prop_user_roundtrip(
        name in "[a-zA-Z ]{1,20}",
        weight in 0i64..300,
        height in 0i64..250,
        birthday in 0i64..2_000_000_000,
        male in any::<bool>(),
    ) {
        let user = User { id: Some(1), name, weight, height, birthday, male };
        let wire = serialize(&Record::User(user.clone())).unwrap();
        prop_assert_eq!(deserialize(&wire).unwrap(), Record::User(user));
    }
}
