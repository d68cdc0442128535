//! Backend service driven end to end
//!
//! A real `FitService` on loopback UDP, an in-memory database and the
//! scripted mock driver; the test talks to it only through `ControlClient`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fitbridge_ble::{
    DriverCall, DriverEvent, FoundDevice, GattCharacteristic, GattService, MockDriver,
};
use fitbridge_core::{
    ConfirmCode, Database, Device, DeviceState, DisconnectReason, FitConfig, FleetConfig, HrDeviceOutput, Label,
    LivenessMode, OscConfig, Session, User, View,
};
use fitbridge_osc::{Arg, Delivery, OscTransport};
use fitbridge_runtime::devices::{BATTERY_LEVEL, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};
use fitbridge_runtime::{ControlClient, FitService, ServiceError};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

struct Seed {
    db: Database,
    user: i64,
    view: i64,
}

/// One user and one view labelling every `(alias, address, order)` device
fn seed(devices: &[(&str, &str, i64)]) -> Seed {
    let db = Database::open_in_memory().unwrap();
    db.bootstrap().unwrap();
    let mut user = User::new("ann");
    db.save(&mut user, true).unwrap();

    let mut view = View::new("ride");
    for (alias, address, order) in devices {
        let mut device = Device::new("hrdevice", *address)
            .with_alias(*alias)
            .with_order(*order);
        db.save(&mut device, true).unwrap();
        view.items.push(Label::new(device.id.unwrap(), "fitobj"));
    }
    db.save(&mut view, true).unwrap();
    Seed {
        user: user.id.unwrap(),
        view: view.id.unwrap(),
        db,
    }
}

fn hr_mock(addresses: &[&str]) -> MockDriver {
    let mut mock = MockDriver::new();
    for address in addresses {
        let service = GattService {
            uuid: HEART_RATE_SERVICE,
            characteristics: vec![
                GattCharacteristic::new(HEART_RATE_MEASUREMENT),
                GattCharacteristic::new(BATTERY_LEVEL),
            ],
        };
        mock = mock
            .with_advertisement(FoundDevice::new(*address).with_service(HEART_RATE_SERVICE))
            .with_services(address, vec![service])
            .with_read_value(address, BATTERY_LEVEL, vec![90]);
    }
    mock
}

struct Harness {
    client: ControlClient,
    states: UnboundedReceiver<Delivery>,
    service: JoinHandle<fitbridge_runtime::Result<()>>,
    undone: Arc<AtomicBool>,
}

async fn start(db: Database, mock: MockDriver, fleet: FleetConfig) -> Harness {
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (addr_a, addr_b) = (a.local_addr().unwrap(), b.local_addr().unwrap());
    let hop = OscConfig::new(addr_a, addr_b)
        .with_liveness(LivenessMode::Receiver)
        .with_ping_interval(Duration::from_millis(50))
        .with_ping_timeout(Duration::from_secs(1))
        .with_command_timeout(Duration::from_secs(2));
    let backend = OscTransport::start_with_socket(a, addr_b, &hop).unwrap();
    let frontend = OscTransport::start_with_socket(b, addr_a, &hop.mirrored()).unwrap();

    let config = FitConfig::default().with_fleet(fleet);
    let mut service = FitService::new(config, db, backend, Arc::new(mock));
    let undone = Arc::new(AtomicBool::new(false));
    let flag = undone.clone();
    service.undo_chain().push("radio", async move {
        flag.store(true, Ordering::SeqCst);
    });
    service.start().unwrap();
    let service = tokio::spawn(service.run());

    let client = ControlClient::new(frontend);
    let states = client.states().unwrap();
    // the backend holds its replies until the first ping
    sleep(Duration::from_millis(150)).await;
    Harness {
        client,
        states,
        service,
        undone,
    }
}

async fn wait_state(states: &mut UnboundedReceiver<Delivery>, uid: &str, target: DeviceState) {
    let reached = timeout(WAIT, async {
        while let Some(delivery) = states.recv().await {
            let new = delivery.args.get(1).and_then(Arg::as_i64);
            if delivery.uid.as_deref() == Some(uid) && new == Some(i64::from(target.code())) {
                return;
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "{uid} never reached {target}");
}

async fn manager_uid(client: &ControlClient, alias: &str) -> String {
    client
        .list_devices()
        .await
        .unwrap()
        .into_iter()
        .find(|l| l.device.alias == alias)
        .map(|l| l.uid)
        .unwrap()
}

fn scan_count(mock: &MockDriver) -> usize {
    mock.calls()
        .iter()
        .filter(|c| matches!(c, DriverCall::StartScan { .. }))
        .count()
}

async fn stop(harness: Harness) {
    harness.client.stop().await.unwrap();
    let result = timeout(WAIT, harness.service).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(harness.undone.load(Ordering::SeqCst));
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_delete_is_refused_while_a_device_is_connected() {
    let seed = seed(&[("belt", "AA:00:00:00:00:01", 1)]);
    let mock = hr_mock(&["AA:00:00:00:00:01"]);
    let mut h = start(seed.db, mock, FleetConfig::default()).await;

    let uid = manager_uid(&h.client, "belt").await;
    assert_eq!(h.client.connect_views(seed.user, &[seed.view]).await.unwrap(), 1);
    wait_state(&mut h.states, &uid, DeviceState::Idle).await;

    match h.client.delete_device(&uid).await {
        Err(ServiceError::Rejected { code, message }) => {
            assert_eq!(code, ConfirmCode::Failed2);
            assert_eq!(message, "Please disconnect all devices before");
        }
        other => panic!("delete accepted: {other:?}"),
    }
    let refused = h.client.save_user(User::new("bob")).await;
    assert!(matches!(
        refused,
        Err(ServiceError::Rejected { code: ConfirmCode::Failed2, .. })
    ));

    let listed = h.client.list_devices().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].info.battery, Some(90));

    h.client.disconnect_views(&[]).await.unwrap();
    wait_state(&mut h.states, &uid, DeviceState::Disconnected).await;
    h.client.delete_device(&uid).await.unwrap();
    assert!(h.client.list_devices().await.unwrap().is_empty());
    let views = h.client.list_views().await.unwrap();
    assert!(views[0].items.is_empty());
    assert!(!views[0].active);

    stop(h).await;
}

#[tokio::test]
async fn test_fleet_connects_in_order_and_retries_a_failed_connect() {
    let seed = seed(&[
        ("bike", "AA:00:00:00:00:10", 10),
        ("belt", "AA:00:00:00:00:05", 5),
    ]);
    let mock = hr_mock(&["AA:00:00:00:00:10", "AA:00:00:00:00:05"]);
    mock.fail_connects("AA:00:00:00:00:05", 1);
    let fleet = FleetConfig::default().with_connect_secs(1);
    let mut h = start(seed.db, mock.clone(), fleet).await;

    let first = manager_uid(&h.client, "belt").await;
    let second = manager_uid(&h.client, "bike").await;
    h.client.connect_views(seed.user, &[seed.view]).await.unwrap();
    wait_state(&mut h.states, &first, DeviceState::Idle).await;
    wait_state(&mut h.states, &second, DeviceState::Idle).await;

    let connects: Vec<String> = mock
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            DriverCall::ConnectGatt { address } => Some(address),
            _ => None,
        })
        .collect();
    assert_eq!(
        connects,
        vec!["AA:00:00:00:00:05", "AA:00:00:00:00:05", "AA:00:00:00:00:10"]
    );

    stop(h).await;
}

#[tokio::test]
async fn test_notifications_become_fits_with_a_session() {
    let seed = seed(&[("belt", "AA:00:00:00:00:01", 1)]);
    let mock = hr_mock(&["AA:00:00:00:00:01"]);
    let mut h = start(seed.db, mock.clone(), FleetConfig::default()).await;
    let mut fits = h.client.fits().unwrap();
    let mut sessions = h
        .client
        .transport()
        .subscribe(fitbridge_osc::address::DEVICE_SESSION, fitbridge_osc::WILDCARD_UID)
        .unwrap();

    let uid = manager_uid(&h.client, "belt").await;
    h.client.connect_views(seed.user, &[seed.view]).await.unwrap();
    wait_state(&mut h.states, &uid, DeviceState::Idle).await;

    mock.emit(DriverEvent::CharacteristicChanged {
        address: "AA:00:00:00:00:01".into(),
        characteristic: GattCharacteristic::new(HEART_RATE_MEASUREMENT).with_value(vec![0x06, 72]),
    });

    let fit = timeout(WAIT, fits.recv()).await.unwrap().unwrap();
    assert_eq!(fit.uid.as_deref(), Some(uid.as_str()));
    let device: Device = fit.args[0].clone().into_entity().unwrap();
    assert_eq!(device.alias, "belt");
    let sample: HrDeviceOutput = fit.args[1].clone().into_entity().unwrap();
    assert_eq!(sample.pulse, 72);
    assert_eq!(sample.worn, 1);
    assert_eq!(sample.battery, 90);
    assert!(sample.session.is_some());

    let opened = timeout(WAIT, sessions.recv()).await.unwrap().unwrap();
    let session: Session = opened.args[0].clone().into_entity().unwrap();
    assert_eq!(session.id, sample.session);
    assert_eq!(session.user, seed.user);

    stop(h).await;
}

#[tokio::test]
async fn test_search_is_refused_while_another_device_is_connected() {
    let seed = seed(&[("belt", "AA:00:00:00:00:01", 1)]);
    let mock = hr_mock(&["AA:00:00:00:00:01"]);
    let mut h = start(seed.db, mock.clone(), FleetConfig::default()).await;

    let belt = manager_uid(&h.client, "belt").await;
    let fresh = h.client.new_device("hrdevice").await.unwrap();
    h.client.connect_views(seed.user, &[seed.view]).await.unwrap();
    wait_state(&mut h.states, &belt, DeviceState::Idle).await;
    let scans_before = scan_count(&mock);

    match h.client.search(&fresh, true).await {
        Err(ServiceError::Rejected { code, message }) => {
            assert_eq!(code, ConfirmCode::Failed2);
            assert_eq!(message, "Please disconnect all devices before");
        }
        other => panic!("search accepted: {other:?}"),
    }
    assert_eq!(scan_count(&mock), scans_before);

    stop(h).await;
}

#[tokio::test]
async fn test_search_reports_each_address_then_stops() {
    let seed = seed(&[]);
    let addresses = ["AA:00:00:00:00:21", "AA:00:00:00:00:22"];
    let mock = hr_mock(&addresses);
    let mut h = start(seed.db, mock.clone(), FleetConfig::default()).await;
    let mut found = h.client.found().unwrap();

    let uid = h.client.new_device("hrdevice").await.unwrap();
    h.client.search(&uid, true).await.unwrap();
    wait_state(&mut h.states, &uid, DeviceState::Searching).await;

    let mut seen = Vec::new();
    for _ in 0..addresses.len() {
        let delivery = timeout(WAIT, found.recv()).await.unwrap().unwrap();
        assert_eq!(delivery.uid.as_deref(), Some(uid.as_str()));
        let device: Device = delivery.args[0].clone().into_entity().unwrap();
        assert_eq!(device.kind, "hrdevice");
        seen.push(device.address);
    }
    seen.sort();
    assert_eq!(seen, addresses);

    // a repeated advertisement is not reported again
    mock.emit(DriverEvent::DeviceFound(
        FoundDevice::new(addresses[0]).with_service(HEART_RATE_SERVICE),
    ));
    assert!(timeout(Duration::from_millis(300), found.recv()).await.is_err());

    h.client.search(&uid, false).await.unwrap();
    let stopped = timeout(WAIT, async {
        while let Some(delivery) = h.states.recv().await {
            if delivery.uid.as_deref() != Some(uid.as_str()) {
                continue;
            }
            let new = delivery.args.get(1).and_then(Arg::as_i64);
            if new == Some(i64::from(DeviceState::Disconnected.code())) {
                return delivery.args.get(2).and_then(Arg::as_i64);
            }
        }
        None
    })
    .await
    .unwrap();
    assert_eq!(stopped, Some(i64::from(DisconnectReason::Requested.code())));
    assert!(mock
        .calls()
        .iter()
        .any(|c| matches!(c, DriverCall::StopScan { .. })));

    stop(h).await;
}

#[tokio::test]
async fn test_new_device_then_save() {
    let seed = seed(&[]);
    let h = start(seed.db, MockDriver::new(), FleetConfig::default()).await;

    let uid = h.client.new_device("hrdevice").await.unwrap();
    let saved = h
        .client
        .save_device(&uid, Device::new("ignored", "AA:00:00:00:00:07").with_alias("chest"))
        .await
        .unwrap();
    assert!(saved.id.is_some());
    assert_eq!(saved.kind, "hrdevice");

    let listed = h.client.list_devices().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].uid, uid);
    assert_eq!(listed[0].state, DeviceState::Uninit);

    match h.client.new_device("rower").await {
        Err(ServiceError::Rejected { code, .. }) => assert_eq!(code, ConfirmCode::Failed1),
        other => panic!("unknown type accepted: {other:?}"),
    }
    let bad_alias = h
        .client
        .save_device(&uid, Device::new("hrdevice", "AA").with_alias("no spaces"))
        .await;
    assert!(matches!(
        bad_alias,
        Err(ServiceError::Rejected { code: ConfirmCode::Failed1, .. })
    ));

    stop(h).await;
}

#[tokio::test]
async fn test_failed_device_save_does_not_leak_into_later_saves() {
    let seed = seed(&[("belt", "AA:00:00:00:00:01", 1)]);
    let h = start(seed.db, MockDriver::new(), FleetConfig::default()).await;

    let uid = h.client.new_device("hrdevice").await.unwrap();
    let clash = h
        .client
        .save_device(&uid, Device::new("hrdevice", "AA:00:00:00:00:02").with_alias("belt"))
        .await;
    assert!(matches!(
        clash,
        Err(ServiceError::Rejected { code: ConfirmCode::Failed1, .. })
    ));

    h.client.save_user(User::new("bob")).await.unwrap();
    let mut orphan = View::new("orphan");
    orphan.items.push(Label::new(999, "fitobj"));
    assert!(h.client.save_view(orphan).await.is_err());

    let listed = h.client.list_devices().await.unwrap();
    assert_eq!(listed.len(), 2);
    let fresh = listed.iter().find(|l| l.uid == uid).unwrap();
    assert!(fresh.device.id.is_none());
    assert_eq!(h.client.list_users().await.unwrap().len(), 2);
    assert_eq!(h.client.list_views().await.unwrap().len(), 1);

    stop(h).await;
}

#[tokio::test]
async fn test_users_and_views_round_trip() {
    let seed = seed(&[("belt", "AA:00:00:00:00:01", 1)]);
    let h = start(seed.db, MockDriver::new(), FleetConfig::default()).await;

    let bob = h.client.save_user(User::new("bob")).await.unwrap();
    let users = h.client.list_users().await.unwrap();
    assert_eq!(users.len(), 2);
    h.client.delete_user(bob.id.unwrap()).await.unwrap();
    assert_eq!(h.client.list_users().await.unwrap().len(), 1);

    let mut orphan = View::new("orphan");
    orphan.items.push(Label::new(999, "fitobj"));
    assert!(h.client.save_view(orphan).await.is_err());

    h.client.delete_view(seed.view).await.unwrap();
    assert!(h.client.list_views().await.unwrap().is_empty());

    stop(h).await;
}
