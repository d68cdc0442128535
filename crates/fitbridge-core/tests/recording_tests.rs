//! Session recording against a real in-memory database
//!
//! Drives derivators through `DeviceSimulator` and checks what ends up in the
//! store: sessions exist before their samples, commits are coalesced, and
//! sessions chain to the main session.

use std::cell::Cell;

use fitbridge_core::{
    Database, DerivatorConfig, Device, DeviceSimulator, HeartRateDerivator, HrDeviceOutput,
    KeiserDerivator, KeiserM3iOutput, Result, Sample, SampleStore, Session, SessionRecorder,
    StepState, User,
};

/// Database wrapper that counts commits
struct CountingStore {
    db: Database,
    commits: Cell<usize>,
}

impl SampleStore for CountingStore {
    fn insert_session(&self, session: &mut Session) -> Result<()> {
        self.db.insert_session(session)
    }

    fn update_session(&self, session: &mut Session) -> Result<()> {
        self.db.update_session(session)
    }

    fn insert_sample(&self, sample: &mut Sample) -> Result<()> {
        self.db.insert_sample(sample)
    }

    fn commit(&self) -> Result<()> {
        self.commits.set(self.commits.get() + 1);
        SampleStore::commit(&self.db)
    }
}

fn setup() -> (CountingStore, i64, i64) {
    let db = Database::open_in_memory().unwrap();
    db.bootstrap().unwrap();
    let mut user = User::new("rider");
    db.save(&mut user, true).unwrap();
    let mut device = Device::new("hrdevice", "00:11:22:33:44:55").with_alias("strap");
    db.save(&mut device, true).unwrap();
    (
        CountingStore {
            db,
            commits: Cell::new(0),
        },
        device.id.unwrap(),
        user.id.unwrap(),
    )
}

fn hr_simulator(device: i64, user: i64) -> DeviceSimulator {
    let config = DerivatorConfig::default();
    DeviceSimulator::new(
        Box::new(HeartRateDerivator::new(&config)),
        SessionRecorder::new(device, user, config.commit_interval_ms),
    )
}

#[test]
fn test_session_opened_on_first_valid_step() {
    let (store, device, user) = setup();
    let mut sim = hr_simulator(device, user);

    let mut idle = Sample::Hr(HrDeviceOutput::new(0, 1, -1));
    assert_eq!(sim.step(&mut idle, 500, &store), StepState::InvalidStep);
    assert!(sim.session().is_none());

    let mut s = Sample::Hr(HrDeviceOutput::new(60, 1, 10));
    assert_eq!(sim.step(&mut s, 1000, &store), StepState::Online);
    let opened = sim.take_opened_session().expect("session opened");
    assert_eq!(opened.date_start, 1000);
    assert!(sim.take_opened_session().is_none());
    assert_eq!(s.session(), opened.id);
}

#[test]
fn test_every_sample_row_references_an_earlier_session() {
    let (store, device, user) = setup();
    let mut sim = hr_simulator(device, user);
    for (t, pulse) in [(0, 60), (1000, 62), (2000, 64), (3000, 66)] {
        let mut s = Sample::Hr(HrDeviceOutput::new(pulse, 1, -1));
        sim.step(&mut s, t, &store);
    }
    sim.finish(&store);

    let sessions: Vec<Session> = store.db.load_all().unwrap();
    assert_eq!(sessions.len(), 1);
    let rows: Vec<HrDeviceOutput> = store.db.load_all().unwrap();
    assert_eq!(rows.len(), 4);
    for row in &rows {
        assert_eq!(row.session, sessions[0].id);
        assert!(sessions[0].date_start <= row.timestamp);
    }
    let last = rows.last().unwrap();
    assert_eq!(last.pulse_mean, 63.0);
    assert_eq!(last.n_beats, 3);
    assert_eq!(last.time_rel_s, 3);
}

#[test]
fn test_commits_are_coalesced_within_span() {
    let (store, device, user) = setup();
    let mut sim = hr_simulator(device, user);

    // one sample per second for 25 s
    for t in 0..25 {
        let mut s = Sample::Hr(HrDeviceOutput::new(70, 1, -1));
        sim.step(&mut s, t * 1000, &store);
    }
    // commits at 0, 10 s and 20 s
    assert_eq!(store.commits.get(), 3);

    // leaving the span forces a commit
    let mut off = Sample::Hr(HrDeviceOutput::new(70, 0, -1));
    assert_eq!(sim.step(&mut off, 25_500, &store), StepState::DPause);
    assert_eq!(store.commits.get(), 4);
    assert!(!store.db.in_transaction());
}

#[test]
fn test_finish_flushes_pending_rows() {
    let (store, device, user) = setup();
    let mut sim = hr_simulator(device, user);
    for t in [0, 1000, 2000] {
        let mut s = Sample::Hr(HrDeviceOutput::new(70, 1, -1));
        sim.step(&mut s, t, &store);
    }
    assert!(store.db.in_transaction());
    sim.finish(&store);
    assert!(!store.db.in_transaction());
}

#[test]
fn test_sessions_chain_to_main_session() {
    let (store, device, user) = setup();
    let mut bike = Device::new("keiserm3i", "AA:AA:AA:AA:AA:AA").with_alias("bike");
    store.db.save(&mut bike, true).unwrap();

    let mut strap = hr_simulator(device, user);
    let config = DerivatorConfig::default();
    let mut bike_sim = DeviceSimulator::new(
        Box::new(KeiserDerivator::new(&config)),
        SessionRecorder::new(bike.id.unwrap(), user, config.commit_interval_ms),
    );

    let mut s = Sample::Hr(HrDeviceOutput::new(70, 1, -1));
    strap.step(&mut s, 0, &store);
    let main = strap.take_opened_session().unwrap().id;

    strap.set_main_session(main);
    bike_sim.set_main_session(main);

    let mut k = Sample::Keiser(KeiserM3iOutput {
        rpm: 600,
        time: 5,
        ..KeiserM3iOutput::default()
    });
    bike_sim.step(&mut k, 500, &store);
    let mut s = Sample::Hr(HrDeviceOutput::new(71, 1, -1));
    strap.step(&mut s, 1000, &store);
    strap.finish(&store);
    bike_sim.finish(&store);

    let sessions: Vec<Session> = store.db.load_all().unwrap();
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s.main_id == main));
}
