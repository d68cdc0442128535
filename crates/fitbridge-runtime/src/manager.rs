//! Device manager state machine
//!
//! One [`DeviceManager`] drives the lifecycle of one device. It never talks to
//! the driver or the clock itself; every input returns the [`ManagerEffect`]s
//! the service carries out on its behalf.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use fitbridge_ble::{
    DriverCall, DriverEvent, FoundDevice, GattService, ScanFilter, GATT_SUCCESS, STATE_CONNECTED,
    STATE_DISCONNECTED,
};
use fitbridge_core::{
    DerivatorConfig, Device, DeviceSimulator, DeviceState, DisconnectReason, Sample, SampleStore,
    Session, SessionRecorder, TimeoutConfig, Uid, User,
};
use tracing::{debug, info, warn};

use crate::devices::{ConnectStrategy, DeviceInfo, DeviceKind};
use crate::error::{Result, ServiceError};

// ----------------------------------------------------------------------------
// Effects and Timers
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Connect scan window, also bounds the GATT connect itself
    ScanWindow,
    /// Periodic scan restart for advertisement-only devices
    Rescan,
    /// No advertisement seen for too long
    Silence,
    /// No notification seen for too long
    GattIdle,
    /// Driver never confirmed the release
    DisconnectGuard,
}

/// Something the service has to do on behalf of a manager
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEffect {
    Driver(DriverCall),
    /// Call back `on_timer(kind, generation)` after `after`
    StartTimer {
        kind: TimerKind,
        after: Duration,
        generation: u64,
    },
    StateChanged {
        old: DeviceState,
        new: DeviceState,
        reason: DisconnectReason,
    },
    /// Candidate device seen while searching
    Found(Device),
    /// Derived sample and the visible state it produced
    Fit { sample: Sample, state: DeviceState },
    SessionOpened(Session),
}

/// What a manager needs from its surroundings while handling an input
pub struct ManagerContext<'a> {
    pub now_ms: i64,
    pub store: &'a dyn SampleStore,
}

// ----------------------------------------------------------------------------
// Device Manager
// ----------------------------------------------------------------------------

pub struct DeviceManager {
    uid: Uid,
    device: Device,
    kind: Arc<dyn DeviceKind>,
    timeouts: TimeoutConfig,
    derivator_config: DerivatorConfig,

    state: DeviceState,
    reason: DisconnectReason,
    /// Reason the running disconnect will be reported with
    pending_reason: DisconnectReason,

    scan_id: Option<String>,
    seen: HashSet<String>,
    gatt_open: bool,
    gatt_queue: VecDeque<DriverCall>,
    /// The one GATT operation awaiting its completion event
    gatt_inflight: Option<DriverCall>,

    timers: HashMap<TimerKind, u64>,
    next_generation: u64,

    info: DeviceInfo,
    user: Option<User>,
    main_session: Option<i64>,
    simulator: Option<DeviceSimulator>,
    last_sample: Option<Sample>,
}

impl DeviceManager {
    pub fn new(uid: Uid, device: Device, kind: Arc<dyn DeviceKind>) -> Self {
        Self {
            uid,
            device,
            kind,
            timeouts: TimeoutConfig::default(),
            derivator_config: DerivatorConfig::default(),
            state: DeviceState::Uninit,
            reason: DisconnectReason::Requested,
            pending_reason: DisconnectReason::Requested,
            scan_id: None,
            seen: HashSet::new(),
            gatt_open: false,
            gatt_queue: VecDeque::new(),
            gatt_inflight: None,
            timers: HashMap::new(),
            next_generation: 0,
            info: DeviceInfo::default(),
            user: None,
            main_session: None,
            simulator: None,
            last_sample: None,
        }
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_derivator_config(mut self, config: DerivatorConfig) -> Self {
        self.derivator_config = config;
        self
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn kind(&self) -> &Arc<dyn DeviceKind> {
        &self.kind
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Reason attached to the latest transition
    pub fn reason(&self) -> DisconnectReason {
        self.reason
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn last_sample(&self) -> Option<&Sample> {
        self.last_sample.as_ref()
    }

    /// Session of the latest connection
    pub fn session(&self) -> Option<&Session> {
        self.simulator.as_ref().and_then(|s| s.session())
    }

    pub fn is_stopped(&self) -> bool {
        self.state.is_stopped()
    }

    /// Replace the persisted configuration; only while stopped
    pub fn set_device(&mut self, device: Device) -> Result<()> {
        if !self.is_stopped() {
            return Err(ServiceError::NotStopped);
        }
        self.device = device;
        Ok(())
    }

    pub fn bind_user(&mut self, user: Option<User>) {
        self.user = user;
    }

    pub fn set_main_session(&mut self, main_id: Option<i64>) {
        self.main_session = main_id;
        if let Some(simulator) = self.simulator.as_mut() {
            simulator.set_main_session(main_id);
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Start or stop looking for devices of this kind
    pub fn search(&mut self, start: bool) -> Result<Vec<ManagerEffect>> {
        let mut effects = Vec::new();
        if !start {
            if self.state == DeviceState::Searching {
                self.stop_scan(&mut effects);
                self.transition(DeviceState::Disconnected, DisconnectReason::Requested, &mut effects);
            }
            return Ok(effects);
        }
        if !self.is_stopped() {
            return Err(ServiceError::NotStopped);
        }

        self.seen.clear();
        let filter = self
            .kind
            .search_filter()
            .with_timeout(Duration::from_secs(self.timeouts.connect_scan_secs));
        self.start_scan(filter, &mut effects);
        self.transition(DeviceState::Searching, DisconnectReason::Requested, &mut effects);
        Ok(effects)
    }

    /// Begin connecting to the configured address
    pub fn connect(&mut self) -> Result<Vec<ManagerEffect>> {
        if !self.is_stopped() {
            return Err(ServiceError::InvalidState {
                state: self.state,
                operation: "connect",
            });
        }
        let device_id = self
            .device
            .id
            .ok_or_else(|| ServiceError::bad_request("device is not saved"))?;
        let user_id = self
            .user
            .as_ref()
            .and_then(|u| u.id)
            .ok_or_else(|| ServiceError::bad_request("no user selected"))?;
        if self.device.address.is_empty() {
            return Err(ServiceError::bad_request("device has no address"));
        }

        let recorder = SessionRecorder::new(
            device_id,
            user_id,
            self.derivator_config.commit_interval_ms,
        );
        let mut simulator =
            DeviceSimulator::new(self.kind.derivator(&self.derivator_config), recorder);
        simulator.set_main_session(self.main_session);
        self.simulator = Some(simulator);
        self.info = DeviceInfo::default();
        self.last_sample = None;
        self.timers.clear();
        self.gatt_open = false;
        self.gatt_queue.clear();
        self.gatt_inflight = None;

        let mut effects = Vec::new();
        let filter = self.kind.connect_filter(&self.device.address);
        self.start_scan(filter, &mut effects);
        match self.kind.strategy() {
            ConnectStrategy::Gatt => {
                self.arm(TimerKind::ScanWindow, self.timeouts.connect_scan_secs, &mut effects);
            }
            ConnectStrategy::Advertisement => {
                self.arm(TimerKind::Rescan, self.timeouts.keiser_rescan_secs, &mut effects);
                self.arm(TimerKind::Silence, self.timeouts.keiser_silence_secs, &mut effects);
            }
        }
        self.transition(DeviceState::Connecting, DisconnectReason::Requested, &mut effects);
        Ok(effects)
    }

    /// Requested disconnect; a no-op when already stopped
    pub fn disconnect(&mut self, ctx: &ManagerContext<'_>) -> Vec<ManagerEffect> {
        let mut effects = Vec::new();
        self.begin_disconnect(DisconnectReason::Requested, ctx, &mut effects);
        effects
    }

    // ------------------------------------------------------------------------
    // Driver Events
    // ------------------------------------------------------------------------

    /// Whether a driver event is meant for this manager
    pub fn concerns(&self, event: &DriverEvent) -> bool {
        match event {
            DriverEvent::ScanStarted { scan_id, .. } | DriverEvent::ScanCompleted { scan_id } => {
                self.scan_id.as_deref() == Some(scan_id.as_str())
            }
            DriverEvent::DeviceFound(_) if self.state == DeviceState::Searching => true,
            DriverEvent::OperationFailed { address: None, .. } => !self.is_stopped(),
            _ if self.is_stopped() => false,
            other => other.address().map_or(false, |a| self.is_my_address(a)),
        }
    }

    pub fn on_driver_event(
        &mut self,
        event: &DriverEvent,
        ctx: &ManagerContext<'_>,
    ) -> Vec<ManagerEffect> {
        let mut effects = Vec::new();
        match event {
            DriverEvent::ScanStarted { status, .. } => {
                if *status != GATT_SUCCESS {
                    self.fail(DisconnectReason::PrepareError, "scan refused", ctx, &mut effects);
                }
            }
            DriverEvent::ScanCompleted { .. } => self.on_scan_completed(ctx, &mut effects),
            DriverEvent::DeviceFound(found) => self.on_found(found, ctx, &mut effects),
            DriverEvent::ConnectionStateChange { status, state, .. } => {
                self.on_connection_state(*status, *state, ctx, &mut effects)
            }
            DriverEvent::Services { status, services, .. } => {
                self.on_services(*status, services, ctx, &mut effects)
            }
            DriverEvent::CharacteristicRead {
                status,
                characteristic,
                ..
            } => {
                if *status == GATT_SUCCESS {
                    self.kind.parse_read(characteristic, &mut self.info);
                } else {
                    debug!("{}: read of {} failed ({})", self.uid, characteristic.uuid, status);
                }
                self.gatt_done(*status == GATT_SUCCESS, ctx, &mut effects);
            }
            DriverEvent::CharacteristicWrite { status, .. }
            | DriverEvent::DescriptorRead { status, .. }
            | DriverEvent::DescriptorWrite { status, .. } => {
                self.gatt_done(*status == GATT_SUCCESS, ctx, &mut effects);
            }
            DriverEvent::CharacteristicChanged { characteristic, .. } => {
                if self.state.is_connected() {
                    self.arm(TimerKind::GattIdle, self.timeouts.gatt_idle_secs, &mut effects);
                    match self.kind.parse_notification(characteristic) {
                        Some(sample) => self.process_sample(sample, ctx, &mut effects),
                        None => debug!("{}: ignoring notification from {}", self.uid, characteristic.uuid),
                    }
                }
            }
            DriverEvent::GattRelease { .. } => {
                if self.state == DeviceState::Disconnecting {
                    self.finish_disconnect(&mut effects);
                } else {
                    self.gatt_open = false;
                }
            }
            DriverEvent::OperationFailed { reason, message, .. } => {
                self.fail(*reason, message, ctx, &mut effects);
            }
        }
        effects
    }

    /// Timer callback; stale generations are ignored
    pub fn on_timer(
        &mut self,
        kind: TimerKind,
        generation: u64,
        ctx: &ManagerContext<'_>,
    ) -> Vec<ManagerEffect> {
        let mut effects = Vec::new();
        if self.timers.get(&kind) != Some(&generation) {
            return effects;
        }
        self.timers.remove(&kind);
        debug!("{}: {:?} timer expired in {}", self.uid, kind, self.state);

        match kind {
            TimerKind::ScanWindow if self.state == DeviceState::Connecting => {
                self.begin_disconnect(DisconnectReason::Timeout, ctx, &mut effects);
            }
            TimerKind::Rescan if self.is_live() => {
                self.stop_scan(&mut effects);
                let filter = self.kind.connect_filter(&self.device.address);
                self.start_scan(filter, &mut effects);
                self.arm(TimerKind::Rescan, self.timeouts.keiser_rescan_secs, &mut effects);
            }
            TimerKind::Silence | TimerKind::GattIdle if self.is_live() => {
                info!("{}: device went silent", self.uid);
                self.begin_disconnect(DisconnectReason::Timeout, ctx, &mut effects);
            }
            TimerKind::DisconnectGuard if self.state == DeviceState::Disconnecting => {
                warn!("{}: driver never confirmed release", self.uid);
                self.finish_disconnect(&mut effects);
            }
            _ => {}
        }
        effects
    }

    // ------------------------------------------------------------------------
    // Event Handlers
    // ------------------------------------------------------------------------

    fn on_scan_completed(&mut self, ctx: &ManagerContext<'_>, effects: &mut Vec<ManagerEffect>) {
        self.scan_id = None;
        match self.state {
            DeviceState::Searching => {
                self.transition(DeviceState::Disconnected, DisconnectReason::Requested, effects);
            }
            DeviceState::Connecting if !self.gatt_open => {
                self.begin_disconnect(DisconnectReason::Timeout, ctx, effects);
            }
            _ => {}
        }
    }

    fn on_found(
        &mut self,
        found: &FoundDevice,
        ctx: &ManagerContext<'_>,
        effects: &mut Vec<ManagerEffect>,
    ) {
        if self.state == DeviceState::Searching {
            if self.kind.recognizes(found) && self.seen.insert(found.address.to_uppercase()) {
                let device = Device::new(self.kind.tag(), found.address.clone())
                    .with_name(found.name.clone().unwrap_or_default());
                effects.push(ManagerEffect::Found(device));
            }
            return;
        }
        if !self.is_my_address(&found.address) {
            return;
        }

        match self.kind.strategy() {
            ConnectStrategy::Gatt => {
                if self.state == DeviceState::Connecting && !self.gatt_open {
                    self.stop_scan(effects);
                    self.gatt_open = true;
                    effects.push(ManagerEffect::Driver(DriverCall::ConnectGatt {
                        address: self.device.address.clone(),
                    }));
                }
            }
            ConnectStrategy::Advertisement => {
                if !self.is_live() {
                    return;
                }
                let Some(sample) = self.kind.parse_advertisement(found) else {
                    return;
                };
                self.arm(TimerKind::Silence, self.timeouts.keiser_silence_secs, effects);
                if self.state == DeviceState::Connecting {
                    self.transition(DeviceState::Connected, DisconnectReason::StateChange, effects);
                }
                self.process_sample(sample, ctx, effects);
            }
        }
    }

    fn on_connection_state(
        &mut self,
        status: i32,
        state: i32,
        ctx: &ManagerContext<'_>,
        effects: &mut Vec<ManagerEffect>,
    ) {
        if state == STATE_CONNECTED && status == GATT_SUCCESS {
            if self.state == DeviceState::Connecting && self.kind.strategy() == ConnectStrategy::Gatt {
                self.cancel(TimerKind::ScanWindow);
                self.transition(DeviceState::Connected, DisconnectReason::StateChange, effects);
                effects.push(ManagerEffect::Driver(DriverCall::DiscoverServices {
                    address: self.device.address.clone(),
                }));
                self.arm(TimerKind::GattIdle, self.timeouts.gatt_idle_secs, effects);
            }
            return;
        }
        if state != STATE_DISCONNECTED {
            if status != GATT_SUCCESS {
                self.fail(DisconnectReason::OperationError, "connection error", ctx, effects);
            }
            return;
        }

        self.gatt_open = false;
        match self.state {
            DeviceState::Disconnecting => self.finish_disconnect(effects),
            DeviceState::Connecting => {
                info!("{}: connect failed (status {})", self.uid, status);
                self.release(ctx);
                self.transition(DeviceState::Disconnected, DisconnectReason::OperationError, effects);
            }
            s if s.is_connected() => {
                warn!("{}: connection dropped", self.uid);
                self.release(ctx);
                self.transition(DeviceState::Disconnected, DisconnectReason::OperationError, effects);
            }
            _ => {}
        }
    }

    fn on_services(
        &mut self,
        status: i32,
        services: &[GattService],
        ctx: &ManagerContext<'_>,
        effects: &mut Vec<ManagerEffect>,
    ) {
        if self.state != DeviceState::Connected {
            return;
        }
        if status != GATT_SUCCESS {
            self.begin_disconnect(DisconnectReason::OperationError, ctx, effects);
            return;
        }
        let present = |uuid| services.iter().any(|s| s.characteristic(uuid).is_some());
        let address = self.device.address.clone();

        for uuid in self.kind.read_characteristics() {
            if present(*uuid) {
                self.gatt_queue.push_back(DriverCall::ReadCharacteristic {
                    address: address.clone(),
                    characteristic: *uuid,
                });
            }
        }
        let mut subscribed = 0;
        for uuid in self.kind.notify_characteristics() {
            if present(*uuid) {
                subscribed += 1;
                self.gatt_queue.push_back(DriverCall::EnableNotifications {
                    address: address.clone(),
                    characteristic: *uuid,
                    enable: true,
                });
            }
        }
        if subscribed == 0 {
            warn!("{}: no data characteristic on {}", self.uid, address);
            self.gatt_queue.clear();
            self.begin_disconnect(DisconnectReason::OperationError, ctx, effects);
            return;
        }
        self.pump_gatt(effects);
    }

    fn gatt_done(&mut self, ok: bool, ctx: &ManagerContext<'_>, effects: &mut Vec<ManagerEffect>) {
        let Some(call) = self.gatt_inflight.take() else {
            return;
        };
        // reads are best effort, a failed subscription leaves no data source
        if !ok && matches!(call, DriverCall::EnableNotifications { .. }) {
            self.gatt_queue.clear();
            self.begin_disconnect(DisconnectReason::OperationError, ctx, effects);
            return;
        }
        self.pump_gatt(effects);
    }

    /// Issue the next queued GATT operation, one at a time
    fn pump_gatt(&mut self, effects: &mut Vec<ManagerEffect>) {
        if self.gatt_inflight.is_some() {
            return;
        }
        match self.gatt_queue.pop_front() {
            Some(call) => {
                self.gatt_inflight = Some(call.clone());
                effects.push(ManagerEffect::Driver(call));
            }
            None if self.state == DeviceState::Connected => {
                self.transition(DeviceState::Idle, DisconnectReason::StateChange, effects);
            }
            None => {}
        }
    }

    fn process_sample(
        &mut self,
        mut sample: Sample,
        ctx: &ManagerContext<'_>,
        effects: &mut Vec<ManagerEffect>,
    ) {
        self.kind.decorate(&mut sample, &self.info);
        let Some(simulator) = self.simulator.as_mut() else {
            return;
        };
        let step = simulator.step(&mut sample, ctx.now_ms, ctx.store);
        let opened = simulator.take_opened_session();
        if let Some(session) = opened {
            effects.push(ManagerEffect::SessionOpened(session));
        }
        let visible = step.device_state();
        self.transition(visible, DisconnectReason::Simulator, effects);
        self.last_sample = Some(sample.clone());
        effects.push(ManagerEffect::Fit {
            sample,
            state: visible,
        });
    }

    fn fail(
        &mut self,
        reason: DisconnectReason,
        message: &str,
        ctx: &ManagerContext<'_>,
        effects: &mut Vec<ManagerEffect>,
    ) {
        warn!("{}: {} ({})", self.uid, message, reason);
        match self.state {
            s if s.is_stopped() => {}
            DeviceState::Searching => {
                self.scan_id = None;
                self.transition(DeviceState::Disconnected, reason, effects);
            }
            DeviceState::Disconnecting => self.finish_disconnect(effects),
            _ if reason.is_fatal() => {
                // the driver cannot release anything anymore
                self.release(ctx);
                self.scan_id = None;
                self.gatt_open = false;
                self.transition(DeviceState::Disconnected, reason, effects);
            }
            _ => self.begin_disconnect(reason, ctx, effects),
        }
    }

    // ------------------------------------------------------------------------
    // Disconnect
    // ------------------------------------------------------------------------

    fn begin_disconnect(
        &mut self,
        reason: DisconnectReason,
        ctx: &ManagerContext<'_>,
        effects: &mut Vec<ManagerEffect>,
    ) {
        match self.state {
            s if s.is_stopped() => return,
            DeviceState::Disconnecting => return,
            DeviceState::Searching => {
                self.stop_scan(effects);
                self.transition(DeviceState::Disconnected, reason, effects);
                return;
            }
            _ => {}
        }

        self.pending_reason = reason;
        self.release(ctx);
        self.stop_scan(effects);
        self.transition(DeviceState::Disconnecting, reason, effects);
        if self.gatt_open {
            effects.push(ManagerEffect::Driver(DriverCall::CloseGatt {
                address: self.device.address.clone(),
            }));
            self.arm(TimerKind::DisconnectGuard, self.timeouts.disconnect_secs, effects);
        } else {
            self.finish_disconnect(effects);
        }
    }

    fn finish_disconnect(&mut self, effects: &mut Vec<ManagerEffect>) {
        self.gatt_open = false;
        self.timers.clear();
        self.transition(DeviceState::Disconnected, self.pending_reason, effects);
    }

    /// Drop timers and pending GATT work, flush the session
    fn release(&mut self, ctx: &ManagerContext<'_>) {
        self.timers.clear();
        self.gatt_queue.clear();
        self.gatt_inflight = None;
        if let Some(simulator) = self.simulator.as_mut() {
            simulator.finish(ctx.store);
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn transition(
        &mut self,
        new: DeviceState,
        reason: DisconnectReason,
        effects: &mut Vec<ManagerEffect>,
    ) {
        let old = self.state;
        if old == new {
            return;
        }
        info!("{} [{}]: {} -> {} ({})", self.uid, self.device.alias, old, new, reason);
        self.state = new;
        self.reason = reason;
        effects.push(ManagerEffect::StateChanged { old, new, reason });
    }

    fn start_scan(&mut self, filter: ScanFilter, effects: &mut Vec<ManagerEffect>) {
        let scan_id = Uid::generate().to_string();
        self.scan_id = Some(scan_id.clone());
        effects.push(ManagerEffect::Driver(DriverCall::StartScan { scan_id, filter }));
    }

    fn stop_scan(&mut self, effects: &mut Vec<ManagerEffect>) {
        if let Some(scan_id) = self.scan_id.take() {
            effects.push(ManagerEffect::Driver(DriverCall::StopScan { scan_id }));
        }
    }

    fn arm(&mut self, kind: TimerKind, secs: u64, effects: &mut Vec<ManagerEffect>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.timers.insert(kind, generation);
        effects.push(ManagerEffect::StartTimer {
            kind,
            after: Duration::from_secs(secs),
            generation,
        });
    }

    fn cancel(&mut self, kind: TimerKind) {
        self.timers.remove(&kind);
    }

    /// Connecting or connected
    fn is_live(&self) -> bool {
        self.state == DeviceState::Connecting || self.state.is_connected()
    }

    fn is_my_address(&self, address: &str) -> bool {
        !self.device.address.is_empty() && self.device.address.eq_ignore_ascii_case(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{
        HeartRateKind, KeiserKind, BATTERY_LEVEL, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE,
        KEISER_COMPANY_ID,
    };
    use fitbridge_ble::{GattCharacteristic, GattDescriptor, CCCD_UUID, GATT_FAILURE};
    use fitbridge_core::Database;

    const HR_ADDR: &str = "AA:BB:CC:DD:EE:01";
    const BIKE_ADDR: &str = "AA:BB:CC:DD:EE:02";

    struct Fixture {
        db: Database,
        now_ms: i64,
    }

    impl Fixture {
        fn new() -> Self {
            let db = Database::open_in_memory().unwrap();
            db.bootstrap().unwrap();
            Self { db, now_ms: 1_000 }
        }

        fn ctx(&self) -> ManagerContext<'_> {
            ManagerContext {
                now_ms: self.now_ms,
                store: &self.db,
            }
        }

        fn manager(&self, kind: Arc<dyn DeviceKind>, address: &str) -> DeviceManager {
            let mut user = User::new("ada");
            self.db.save(&mut user, true).unwrap();
            let mut device =
                Device::new(kind.tag(), address).with_alias(format!("dev{}", address.replace(':', "")));
            self.db.save(&mut device, true).unwrap();
            let mut manager = DeviceManager::new(Uid::generate(), device, kind);
            manager.bind_user(Some(user));
            manager
        }
    }

    fn states(effects: &[ManagerEffect]) -> Vec<DeviceState> {
        effects
            .iter()
            .filter_map(|e| match e {
                ManagerEffect::StateChanged { new, .. } => Some(*new),
                _ => None,
            })
            .collect()
    }

    fn driver_calls(effects: &[ManagerEffect]) -> Vec<DriverCall> {
        effects
            .iter()
            .filter_map(|e| match e {
                ManagerEffect::Driver(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn timer(effects: &[ManagerEffect], wanted: TimerKind) -> Option<u64> {
        effects.iter().rev().find_map(|e| match e {
            ManagerEffect::StartTimer {
                kind, generation, ..
            } if *kind == wanted => Some(*generation),
            _ => None,
        })
    }

    fn hr_services() -> Vec<GattService> {
        vec![GattService {
            uuid: HEART_RATE_SERVICE,
            characteristics: vec![
                GattCharacteristic::new(HEART_RATE_MEASUREMENT),
                GattCharacteristic::new(BATTERY_LEVEL),
            ],
        }]
    }

    fn connect_hr(fx: &Fixture, manager: &mut DeviceManager) {
        manager.connect().unwrap();
        let ctx = fx.ctx();
        manager.on_driver_event(&DriverEvent::DeviceFound(FoundDevice::new(HR_ADDR)), &ctx);
        manager.on_driver_event(
            &DriverEvent::ConnectionStateChange {
                address: HR_ADDR.into(),
                status: GATT_SUCCESS,
                state: STATE_CONNECTED,
            },
            &ctx,
        );
        manager.on_driver_event(
            &DriverEvent::Services {
                address: HR_ADDR.into(),
                status: GATT_SUCCESS,
                services: hr_services(),
            },
            &ctx,
        );
        manager.on_driver_event(
            &DriverEvent::CharacteristicRead {
                address: HR_ADDR.into(),
                status: GATT_SUCCESS,
                characteristic: GattCharacteristic::new(BATTERY_LEVEL).with_value(vec![64]),
            },
            &ctx,
        );
        manager.on_driver_event(
            &DriverEvent::DescriptorWrite {
                address: HR_ADDR.into(),
                status: GATT_SUCCESS,
                descriptor: GattDescriptor::new(CCCD_UUID, vec![1, 0]),
            },
            &ctx,
        );
    }

    #[test]
    fn test_gatt_connect_sequence() {
        let fx = Fixture::new();
        let mut manager = fx.manager(Arc::new(HeartRateKind), HR_ADDR);
        let ctx = fx.ctx();

        let effects = manager.connect().unwrap();
        assert_eq!(states(&effects), vec![DeviceState::Connecting]);
        assert!(matches!(
            driver_calls(&effects).as_slice(),
            [DriverCall::StartScan { filter, .. }] if filter.addresses == vec![HR_ADDR.to_string()]
        ));
        assert!(timer(&effects, TimerKind::ScanWindow).is_some());

        let effects =
            manager.on_driver_event(&DriverEvent::DeviceFound(FoundDevice::new(HR_ADDR)), &ctx);
        let calls = driver_calls(&effects);
        assert!(matches!(calls[0], DriverCall::StopScan { .. }));
        assert_eq!(calls[1], DriverCall::ConnectGatt { address: HR_ADDR.into() });

        let effects = manager.on_driver_event(
            &DriverEvent::ConnectionStateChange {
                address: HR_ADDR.into(),
                status: GATT_SUCCESS,
                state: STATE_CONNECTED,
            },
            &ctx,
        );
        assert_eq!(states(&effects), vec![DeviceState::Connected]);
        assert_eq!(
            driver_calls(&effects),
            vec![DriverCall::DiscoverServices { address: HR_ADDR.into() }]
        );

        // reads go first, one operation at a time
        let effects = manager.on_driver_event(
            &DriverEvent::Services {
                address: HR_ADDR.into(),
                status: GATT_SUCCESS,
                services: hr_services(),
            },
            &ctx,
        );
        assert_eq!(
            driver_calls(&effects),
            vec![DriverCall::ReadCharacteristic {
                address: HR_ADDR.into(),
                characteristic: BATTERY_LEVEL
            }]
        );
        let effects = manager.on_driver_event(
            &DriverEvent::CharacteristicRead {
                address: HR_ADDR.into(),
                status: GATT_SUCCESS,
                characteristic: GattCharacteristic::new(BATTERY_LEVEL).with_value(vec![64]),
            },
            &ctx,
        );
        assert_eq!(
            driver_calls(&effects),
            vec![DriverCall::EnableNotifications {
                address: HR_ADDR.into(),
                characteristic: HEART_RATE_MEASUREMENT,
                enable: true
            }]
        );
        assert_eq!(manager.info().battery, Some(64));

        let effects = manager.on_driver_event(
            &DriverEvent::DescriptorWrite {
                address: HR_ADDR.into(),
                status: GATT_SUCCESS,
                descriptor: GattDescriptor::new(CCCD_UUID, vec![1, 0]),
            },
            &ctx,
        );
        assert_eq!(states(&effects), vec![DeviceState::Idle]);
    }

    #[test]
    fn test_notifications_drive_visible_state_and_session() {
        let fx = Fixture::new();
        let mut manager = fx.manager(Arc::new(HeartRateKind), HR_ADDR);
        connect_hr(&fx, &mut manager);

        let notify = |value: Vec<u8>| DriverEvent::CharacteristicChanged {
            address: HR_ADDR.into(),
            characteristic: GattCharacteristic::new(HEART_RATE_MEASUREMENT).with_value(value),
        };

        // worn sensor, 60 bpm
        let effects = manager.on_driver_event(&notify(vec![0x06, 60]), &fx.ctx());
        assert_eq!(states(&effects), vec![DeviceState::Online]);
        let session = effects.iter().find_map(|e| match e {
            ManagerEffect::SessionOpened(s) => Some(s.clone()),
            _ => None,
        });
        let session = session.expect("first active sample opens a session");
        assert_eq!(session.device, manager.device().id.unwrap());
        match effects.last() {
            Some(ManagerEffect::Fit {
                sample: Sample::Hr(hr),
                state,
            }) => {
                assert_eq!(*state, DeviceState::Online);
                assert_eq!(hr.battery, 64);
                assert_eq!(hr.session, session.id);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(timer(&effects, TimerKind::GattIdle).is_some());

        // sensor taken off
        let effects = manager.on_driver_event(&notify(vec![0x04, 0]), &fx.ctx());
        assert_eq!(states(&effects), vec![DeviceState::DPause]);
        assert!(manager.state().is_connected());
    }

    #[test]
    fn test_requested_disconnect_waits_for_release() {
        let fx = Fixture::new();
        let mut manager = fx.manager(Arc::new(HeartRateKind), HR_ADDR);
        connect_hr(&fx, &mut manager);

        let effects = manager.disconnect(&fx.ctx());
        assert_eq!(states(&effects), vec![DeviceState::Disconnecting]);
        assert_eq!(
            driver_calls(&effects),
            vec![DriverCall::CloseGatt { address: HR_ADDR.into() }]
        );
        let guard = timer(&effects, TimerKind::DisconnectGuard).unwrap();

        let effects = manager.on_driver_event(
            &DriverEvent::ConnectionStateChange {
                address: HR_ADDR.into(),
                status: GATT_SUCCESS,
                state: STATE_DISCONNECTED,
            },
            &fx.ctx(),
        );
        assert_eq!(
            effects,
            vec![ManagerEffect::StateChanged {
                old: DeviceState::Disconnecting,
                new: DeviceState::Disconnected,
                reason: DisconnectReason::Requested
            }]
        );
        // guard fired late is stale
        assert!(manager
            .on_timer(TimerKind::DisconnectGuard, guard, &fx.ctx())
            .is_empty());
    }

    #[test]
    fn test_disconnect_guard_forces_release() {
        let fx = Fixture::new();
        let mut manager = fx.manager(Arc::new(HeartRateKind), HR_ADDR);
        connect_hr(&fx, &mut manager);
        let effects = manager.disconnect(&fx.ctx());
        let guard = timer(&effects, TimerKind::DisconnectGuard).unwrap();
        let effects = manager.on_timer(TimerKind::DisconnectGuard, guard, &fx.ctx());
        assert_eq!(states(&effects), vec![DeviceState::Disconnected]);
    }

    #[test]
    fn test_unsolicited_drop_reports_operation_error() {
        let fx = Fixture::new();
        let mut manager = fx.manager(Arc::new(HeartRateKind), HR_ADDR);
        connect_hr(&fx, &mut manager);
        let effects = manager.on_driver_event(
            &DriverEvent::ConnectionStateChange {
                address: HR_ADDR.into(),
                status: GATT_FAILURE,
                state: STATE_DISCONNECTED,
            },
            &fx.ctx(),
        );
        assert_eq!(
            effects,
            vec![ManagerEffect::StateChanged {
                old: DeviceState::Idle,
                new: DeviceState::Disconnected,
                reason: DisconnectReason::OperationError
            }]
        );
    }

    #[test]
    fn test_scan_window_timeout() {
        let fx = Fixture::new();
        let mut manager = fx.manager(Arc::new(HeartRateKind), HR_ADDR);
        let effects = manager.connect().unwrap();
        let window = timer(&effects, TimerKind::ScanWindow).unwrap();

        let effects = manager.on_timer(TimerKind::ScanWindow, window, &fx.ctx());
        assert_eq!(
            states(&effects),
            vec![DeviceState::Disconnecting, DeviceState::Disconnected]
        );
        assert_eq!(manager.reason(), DisconnectReason::Timeout);
        assert!(matches!(
            driver_calls(&effects).as_slice(),
            [DriverCall::StopScan { .. }]
        ));
    }

    #[test]
    fn test_connect_requires_stopped_state() {
        let fx = Fixture::new();
        let mut manager = fx.manager(Arc::new(HeartRateKind), HR_ADDR);
        manager.connect().unwrap();
        assert!(matches!(
            manager.connect(),
            Err(ServiceError::InvalidState { .. })
        ));
        assert!(matches!(manager.search(true), Err(ServiceError::NotStopped)));
    }

    #[test]
    fn test_search_reports_each_device_once() {
        let fx = Fixture::new();
        let mut manager = DeviceManager::new(
            Uid::generate(),
            Device::new("hrdevice", ""),
            Arc::new(HeartRateKind),
        );
        let effects = manager.search(true).unwrap();
        assert_eq!(states(&effects), vec![DeviceState::Searching]);
        let scan_id = match &driver_calls(&effects)[0] {
            DriverCall::StartScan { scan_id, filter } => {
                assert_eq!(filter.services, vec![HEART_RATE_SERVICE]);
                scan_id.clone()
            }
            other => panic!("unexpected {other:?}"),
        };

        let mut found = FoundDevice::new(HR_ADDR).with_name("Polar H10");
        found.services.push(HEART_RATE_SERVICE);
        let event = DriverEvent::DeviceFound(found);
        assert!(manager.concerns(&event));
        let effects = manager.on_driver_event(&event, &fx.ctx());
        assert!(matches!(
            effects.as_slice(),
            [ManagerEffect::Found(d)] if d.address == HR_ADDR && d.name == "Polar H10" && d.kind == "hrdevice"
        ));
        assert!(manager.on_driver_event(&event, &fx.ctx()).is_empty());

        let completed = DriverEvent::ScanCompleted { scan_id };
        assert!(manager.concerns(&completed));
        let effects = manager.on_driver_event(&completed, &fx.ctx());
        assert_eq!(states(&effects), vec![DeviceState::Disconnected]);
        assert_eq!(manager.reason(), DisconnectReason::Requested);
    }

    #[test]
    fn test_search_stopped_by_ble_disabled() {
        let fx = Fixture::new();
        let mut manager =
            DeviceManager::new(Uid::generate(), Device::new("keiserm3i", ""), Arc::new(KeiserKind));
        manager.search(true).unwrap();
        let effects = manager.on_driver_event(
            &DriverEvent::OperationFailed {
                address: None,
                reason: DisconnectReason::BleDisabled,
                message: "adapter off".into(),
            },
            &fx.ctx(),
        );
        assert_eq!(states(&effects), vec![DeviceState::Disconnected]);
        assert_eq!(manager.reason(), DisconnectReason::BleDisabled);
    }

    #[test]
    fn test_advertisement_strategy() {
        let fx = Fixture::new();
        let mut manager = fx.manager(Arc::new(KeiserKind), BIKE_ADDR);
        let effects = manager.connect().unwrap();
        assert!(timer(&effects, TimerKind::Rescan).is_some());
        let silence = timer(&effects, TimerKind::Silence).unwrap();

        let console = vec![
            0x06, 0x21, 0x00, 0x03, 0x00, 0x12, 0x00, 0x96, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0A,
            0x00, 0x28,
        ];
        let advert = |data: Vec<u8>| {
            DriverEvent::DeviceFound(
                FoundDevice::new(BIKE_ADDR).with_manufacturer_data(KEISER_COMPANY_ID, data),
            )
        };

        // malformed advertisement leaves the state alone
        let effects = manager.on_driver_event(&advert(vec![1, 2]), &fx.ctx());
        assert!(effects.is_empty());
        assert_eq!(manager.state(), DeviceState::Connecting);

        let effects = manager.on_driver_event(&advert(console), &fx.ctx());
        assert_eq!(
            states(&effects),
            vec![DeviceState::Connected, DeviceState::Online]
        );
        assert!(manager.last_sample().is_some());

        // the first silence timer was re-armed by the advertisement
        assert!(manager.on_timer(TimerKind::Silence, silence, &fx.ctx()).is_empty());
        let current = *manager.timers.get(&TimerKind::Silence).unwrap();
        let effects = manager.on_timer(TimerKind::Silence, current, &fx.ctx());
        assert_eq!(
            states(&effects),
            vec![DeviceState::Disconnecting, DeviceState::Disconnected]
        );
        assert_eq!(manager.reason(), DisconnectReason::Timeout);
        assert!(manager.session().is_some());
    }

    #[test]
    fn test_rescan_restarts_scanning() {
        let fx = Fixture::new();
        let mut manager = fx.manager(Arc::new(KeiserKind), BIKE_ADDR);
        let effects = manager.connect().unwrap();
        let rescan = timer(&effects, TimerKind::Rescan).unwrap();
        let effects = manager.on_timer(TimerKind::Rescan, rescan, &fx.ctx());
        let calls = driver_calls(&effects);
        assert!(matches!(calls[0], DriverCall::StopScan { .. }));
        assert!(matches!(
            &calls[1],
            DriverCall::StartScan { filter, .. } if filter.manufacturer_ids == vec![KEISER_COMPANY_ID]
        ));
        assert!(timer(&effects, TimerKind::Rescan).is_some());
    }

    #[test]
    fn test_connect_needs_saved_device_and_user() {
        let mut manager =
            DeviceManager::new(Uid::generate(), Device::new("hrdevice", HR_ADDR), Arc::new(HeartRateKind));
        assert!(matches!(manager.connect(), Err(ServiceError::BadRequest(_))));
        assert_eq!(manager.state(), DeviceState::Uninit);
    }
}
