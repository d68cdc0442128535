//! Backend service
//!
//! [`FitService`] owns the database, one [`DeviceManager`] per device and the
//! [`FleetCoordinator`]. Everything runs on a single loop fed by OSC commands,
//! driver events and timer expiries, so no two inputs ever interleave.
//! Driver calls are handed to a worker task that issues them in order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use fitbridge_ble::{BleDriver, DriverCall, DriverEvent};
use fitbridge_core::{
    ConfirmCode, Database, Device, DeviceState, DisconnectReason, Entity, FitConfig, FitError,
    Record, Sample, SystemTimeSource, TimeSource, Uid, User, View,
};
use fitbridge_osc::{address, Arg, Delivery, OscTransport, WILDCARD_UID};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connectors::{variables, ConnectorConfig, ConnectorHub, TemplateRenderer};
use crate::devices::KindRegistry;
use crate::error::{Result, ServiceError};
use crate::fleet::{FleetCoordinator, FleetEffect, ManagerPool};
use crate::manager::{DeviceManager, ManagerContext, ManagerEffect, TimerKind};
use crate::notification::{pick_notification, NotificationSink, TracingNotifications};
use crate::undo::UndoChain;

/// Commands served by the backend
pub const COMMANDS: [&str; 16] = [
    address::STOP,
    address::LOGLEVEL,
    address::NEWDEVICE,
    address::VIEW_CONNECT,
    address::VIEW_DISCONNECT,
    address::SERVE_CONNECTORS,
    address::LISTDEVICES,
    address::LISTUSERS,
    address::LISTVIEWS,
    address::SAVEVIEW,
    address::DELVIEW,
    address::SAVEUSER,
    address::DELUSER,
    address::DEVICE_SAVE,
    address::DEVICE_DEL,
    address::DEVICE_SEARCH,
];

/// Time allowed for queued driver calls to drain on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// Log Control
// ----------------------------------------------------------------------------

/// Runtime verbosity switch behind `/loglevel`
pub trait LogControl: Send + Sync {
    fn set_level(&self, level: &str) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Loop Inputs
// ----------------------------------------------------------------------------

enum ServiceEvent {
    Command(Delivery),
    /// A driver call issued for `uid` was refused
    DriverFailed { uid: Uid, event: DriverEvent },
    ManagerTimer {
        uid: Uid,
        kind: TimerKind,
        generation: u64,
    },
    FleetTimer { generation: u64 },
    Stop,
}

/// Stops a running service from outside the loop
#[derive(Clone)]
pub struct ServiceHandle {
    events: mpsc::UnboundedSender<ServiceEvent>,
}

impl ServiceHandle {
    pub fn stop(&self) {
        let _ = self.events.send(ServiceEvent::Stop);
    }
}

// ----------------------------------------------------------------------------
// Manager Pool
// ----------------------------------------------------------------------------

/// The managers as seen by the fleet coordinator during one input
struct Pool<'a> {
    managers: &'a mut BTreeMap<Uid, DeviceManager>,
    store: &'a Database,
    now_ms: i64,
    effects: Vec<(Uid, ManagerEffect)>,
}

impl ManagerPool for Pool<'_> {
    fn state(&self, uid: &Uid) -> Option<DeviceState> {
        self.managers.get(uid).map(|m| m.state())
    }

    fn sort_key(&self, uid: &Uid) -> (i64, i64) {
        self.managers
            .get(uid)
            .map(|m| (m.device().order, m.device().id.unwrap_or(i64::MAX)))
            .unwrap_or((i64::MAX, i64::MAX))
    }

    fn connect(&mut self, uid: &Uid, user: Option<&User>) -> Result<()> {
        let manager = self
            .managers
            .get_mut(uid)
            .ok_or_else(|| ServiceError::UnknownManager(uid.to_string()))?;
        manager.bind_user(user.cloned());
        let effects = manager.connect()?;
        self.effects.extend(effects.into_iter().map(|e| (uid.clone(), e)));
        Ok(())
    }

    fn disconnect(&mut self, uid: &Uid) {
        let ctx = ManagerContext {
            now_ms: self.now_ms,
            store: self.store,
        };
        if let Some(manager) = self.managers.get_mut(uid) {
            let effects = manager.disconnect(&ctx);
            self.effects.extend(effects.into_iter().map(|e| (uid.clone(), e)));
        }
    }

    fn set_main_session(&mut self, uid: &Uid, main_id: Option<i64>) {
        if let Some(manager) = self.managers.get_mut(uid) {
            manager.set_main_session(main_id);
        }
    }
}

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

pub struct FitService {
    config: FitConfig,
    db: Database,
    transport: OscTransport,
    driver: Arc<dyn BleDriver>,
    registry: KindRegistry,
    clock: Arc<dyn TimeSource>,

    managers: BTreeMap<Uid, DeviceManager>,
    fleet: FleetCoordinator,

    connectors: ConnectorHub,
    notifications: Box<dyn NotificationSink>,
    log_control: Option<Arc<dyn LogControl>>,
    undo: UndoChain,

    events_tx: mpsc::UnboundedSender<ServiceEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ServiceEvent>>,
    calls: Option<mpsc::UnboundedSender<(Uid, DriverCall)>>,
    driver_worker: Option<JoinHandle<()>>,
}

impl FitService {
    pub fn new(
        config: FitConfig,
        db: Database,
        transport: OscTransport,
        driver: Arc<dyn BleDriver>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let fleet = FleetCoordinator::new(config.fleet.clone());
        Self {
            config,
            db,
            transport,
            driver,
            registry: KindRegistry::builtin(),
            clock: Arc::new(SystemTimeSource),
            managers: BTreeMap::new(),
            fleet,
            connectors: ConnectorHub::default(),
            notifications: Box::new(TracingNotifications::default()),
            log_control: None,
            undo: UndoChain::new(),
            events_tx,
            events_rx: Some(events_rx),
            calls: None,
            driver_worker: None,
        }
    }

    pub fn with_registry(mut self, registry: KindRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifications(mut self, sink: Box<dyn NotificationSink>) -> Self {
        self.notifications = sink;
        self
    }

    pub fn with_log_control(mut self, control: Arc<dyn LogControl>) -> Self {
        self.log_control = Some(control);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.connectors = ConnectorHub::new(renderer);
        self
    }

    /// Pre-actions reverted on shutdown
    pub fn undo_chain(&mut self) -> &mut UndoChain {
        &mut self.undo
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            events: self.events_tx.clone(),
        }
    }

    pub fn managers(&self) -> impl Iterator<Item = &DeviceManager> {
        self.managers.values()
    }

    pub fn fleet(&self) -> &FleetCoordinator {
        &self.fleet
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Bootstrap the schema, load every device and install the handlers
    pub fn start(&mut self) -> Result<()> {
        if self.calls.is_some() {
            return Ok(());
        }
        self.db.bootstrap()?;

        for device in self.db.load_all::<Device>()? {
            let alias = device.alias.clone();
            if let Err(e) = self.add_manager(device) {
                warn!("Skipping device {}: {}", alias, e);
            }
        }
        let active = self.active_device_uids()?;
        info!(
            "Loaded {} devices, {} in active views",
            self.managers.len(),
            active.len()
        );

        for command in COMMANDS {
            for scope in ["", WILDCARD_UID] {
                let events = self.events_tx.clone();
                self.transport.handle_device(command, scope, move |delivery| {
                    let _ = events.send(ServiceEvent::Command(delivery));
                })?;
            }
        }

        let (calls, rx) = mpsc::unbounded_channel();
        self.calls = Some(calls);
        self.driver_worker = Some(tokio::spawn(issue_calls(
            self.driver.clone(),
            rx,
            self.events_tx.clone(),
        )));
        Ok(())
    }

    /// Serve until `/stop` or [`ServiceHandle::stop`], then shut down
    pub async fn run(mut self) -> Result<()> {
        self.start()?;
        let Some(mut inbox) = self.events_rx.take() else {
            return Err(ServiceError::bad_request("service already ran"));
        };
        let mut driver_events = self.driver.events();
        let mut driver_open = true;
        info!("Service running on {}", self.transport.local_addr());

        loop {
            tokio::select! {
                event = inbox.recv() => match event {
                    Some(ServiceEvent::Stop) | None => break,
                    Some(event) => {
                        if !self.on_event(event) {
                            break;
                        }
                    }
                },
                event = driver_events.recv(), if driver_open => match event {
                    Ok(event) => self.on_driver_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Dropped {} driver events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("Driver event channel closed");
                        driver_open = false;
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Disconnect everything, flush sessions, run the undo chain and close
    async fn shutdown(&mut self) {
        info!("Stopping service");
        let live: Vec<Uid> = self
            .managers
            .iter()
            .filter(|(_, m)| !m.is_stopped())
            .map(|(uid, _)| uid.clone())
            .collect();
        for uid in live {
            let effects = self.with_manager(&uid, |m, ctx| m.disconnect(ctx));
            self.apply(effects);
        }
        self.connectors.close();
        self.notifications.clear();
        if let Err(e) = self.db.commit() {
            error!("Final commit failed: {}", e);
        }

        let undone = self.undo.run().await;
        debug!("Undo chain ran {} steps", undone);

        self.calls = None;
        if let Some(worker) = self.driver_worker.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, worker).await.is_err() {
                warn!("Driver calls still pending at shutdown");
            }
        }
        self.transport.close().await;
        info!("Service stopped");
    }

    // ------------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------------

    /// Returns false when the loop should end
    fn on_event(&mut self, event: ServiceEvent) -> bool {
        match event {
            ServiceEvent::Command(delivery) => return self.on_command(delivery),
            ServiceEvent::DriverFailed { uid, event } => {
                let effects = self.with_manager(&uid, |m, ctx| m.on_driver_event(&event, ctx));
                self.apply(effects);
            }
            ServiceEvent::ManagerTimer {
                uid,
                kind,
                generation,
            } => {
                let effects = self.with_manager(&uid, |m, ctx| m.on_timer(kind, generation, ctx));
                self.apply(effects);
            }
            ServiceEvent::FleetTimer { generation } => {
                self.drive_fleet(|fleet, pool| fleet.on_timer(generation, pool));
            }
            ServiceEvent::Stop => return false,
        }
        true
    }

    fn on_driver_event(&mut self, event: &DriverEvent) {
        let targets: Vec<Uid> = self
            .managers
            .iter()
            .filter(|(_, m)| m.concerns(event))
            .map(|(uid, _)| uid.clone())
            .collect();
        if targets.is_empty() {
            debug!("Unclaimed driver event {:?}", event);
            return;
        }
        for uid in targets {
            let effects = self.with_manager(&uid, |m, ctx| m.on_driver_event(event, ctx));
            self.apply(effects);
        }
    }

    fn with_manager<F>(&mut self, uid: &Uid, f: F) -> Vec<(Uid, ManagerEffect)>
    where
        F: FnOnce(&mut DeviceManager, &ManagerContext<'_>) -> Vec<ManagerEffect>,
    {
        let ctx = ManagerContext {
            now_ms: self.clock.now_ms(),
            store: &self.db,
        };
        match self.managers.get_mut(uid) {
            Some(manager) => f(manager, &ctx)
                .into_iter()
                .map(|e| (uid.clone(), e))
                .collect(),
            None => {
                debug!("Input for removed manager {}", uid);
                Vec::new()
            }
        }
    }

    /// Run one coordinator step against the managers and carry out the result
    fn drive_fleet<F>(&mut self, f: F)
    where
        F: FnOnce(&mut FleetCoordinator, &mut dyn ManagerPool) -> Vec<FleetEffect>,
    {
        let (fleet_effects, manager_effects) = self.with_pool(f);
        self.apply_fleet(fleet_effects);
        self.apply(manager_effects);
    }

    fn with_pool<R, F>(&mut self, f: F) -> (R, Vec<(Uid, ManagerEffect)>)
    where
        F: FnOnce(&mut FleetCoordinator, &mut dyn ManagerPool) -> R,
    {
        let mut pool = Pool {
            managers: &mut self.managers,
            store: &self.db,
            now_ms: self.clock.now_ms(),
            effects: Vec::new(),
        };
        let out = f(&mut self.fleet, &mut pool);
        (out, pool.effects)
    }

    // ------------------------------------------------------------------------
    // Effects
    // ------------------------------------------------------------------------

    fn apply(&mut self, effects: Vec<(Uid, ManagerEffect)>) {
        let mut queue: VecDeque<(Uid, ManagerEffect)> = effects.into();
        while let Some((uid, effect)) = queue.pop_front() {
            match effect {
                ManagerEffect::Driver(call) => self.issue(uid, call),
                ManagerEffect::StartTimer {
                    kind,
                    after,
                    generation,
                } => self.schedule(
                    after,
                    ServiceEvent::ManagerTimer {
                        uid,
                        kind,
                        generation,
                    },
                ),
                ManagerEffect::StateChanged { old, new, reason } => {
                    self.publish_state(&uid, old, new, reason);
                    let (fleet_effects, more) = self.with_pool(|fleet, pool| {
                        fleet.on_state_change(&uid, old, new, reason, pool)
                    });
                    self.apply_fleet(fleet_effects);
                    queue.extend(more);
                }
                ManagerEffect::Found(device) => {
                    self.emit_device(
                        address::DEVICE_FOUND,
                        &uid,
                        vec![Arg::from(Record::Device(device))],
                    );
                }
                ManagerEffect::Fit { sample, state } => self.publish_fit(&uid, &sample, state),
                ManagerEffect::SessionOpened(session) => {
                    let id = session.id;
                    self.emit_device(
                        address::DEVICE_SESSION,
                        &uid,
                        vec![Arg::from(Record::Session(session))],
                    );
                    if let Some(id) = id {
                        let ((), more) =
                            self.with_pool(|fleet, pool| fleet.on_session_opened(id, pool));
                        queue.extend(more);
                    }
                }
            }
        }
    }

    fn apply_fleet(&mut self, effects: Vec<FleetEffect>) {
        for effect in effects {
            match effect {
                FleetEffect::ArmTimer { after, generation } => {
                    self.schedule(after, ServiceEvent::FleetTimer { generation })
                }
                FleetEffect::PrintMsg(text) => {
                    info!("{}", text);
                    self.emit(address::PRINTMSG, vec![Arg::from(text)]);
                }
            }
        }
    }

    fn issue(&self, uid: Uid, call: DriverCall) {
        debug!("{}: {:?}", uid, call);
        if let Some(calls) = &self.calls {
            let _ = calls.send((uid, call));
        }
    }

    fn schedule(&self, after: Duration, event: ServiceEvent) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(event);
        });
    }

    fn emit(&self, address: &str, args: Vec<Arg>) {
        if let Err(e) = self.transport.send(address, args) {
            warn!("Cannot send {}: {}", address, e);
        }
    }

    fn emit_device(&self, address: &str, uid: &Uid, args: Vec<Arg>) {
        if let Err(e) = self.transport.send_device(address, uid.as_str(), args) {
            warn!("Cannot send {}: {}", address, e);
        }
    }

    fn publish_state(
        &mut self,
        uid: &Uid,
        old: DeviceState,
        new: DeviceState,
        reason: DisconnectReason,
    ) {
        self.emit_device(
            address::DEVICE_STATE,
            uid,
            vec![
                Arg::from(old.code()),
                Arg::from(new.code()),
                Arg::from(reason.code()),
            ],
        );
        if let Some(m) = self.managers.get(uid) {
            let vars = variables(m.device(), new, m.last_sample(), m.session(), m.user());
            self.connectors.publish(&vars);
        }
        self.refresh_notification();
    }

    fn publish_fit(&mut self, uid: &Uid, sample: &Sample, state: DeviceState) {
        let Some(m) = self.managers.get(uid) else {
            return;
        };
        self.emit_device(
            address::DEVICE_FIT,
            uid,
            vec![
                Arg::from(Record::Device(m.device().clone())),
                Arg::from(sample_record(sample)),
                Arg::from(state.code()),
            ],
        );
        let vars = variables(m.device(), state, Some(sample), m.session(), m.user());
        self.connectors.publish(&vars);
        self.refresh_notification();
    }

    fn refresh_notification(&mut self) {
        match pick_notification(self.managers.values()) {
            Some(text) => self.notifications.notify(&text),
            None => self.notifications.clear(),
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Returns false for `/stop`
    fn on_command(&mut self, delivery: Delivery) -> bool {
        let Delivery {
            address: command,
            uid,
            args,
            ..
        } = delivery;
        debug!("Command {} {:?}", command, uid);

        if command == address::STOP {
            if let Some(uid) = &uid {
                self.reply(uid, ConfirmCode::Ok, "", Vec::new());
            }
            return false;
        }

        let result = match command.as_str() {
            address::LOGLEVEL => self.cmd_loglevel(&args),
            address::NEWDEVICE => self.cmd_new_device(&args),
            address::LISTDEVICES => self.cmd_list_devices(uid.as_deref()),
            address::LISTUSERS => self.cmd_list::<User>(address::LISTUSERS_RV, uid.as_deref()),
            address::LISTVIEWS => self.cmd_list::<View>(address::LISTVIEWS_RV, uid.as_deref()),
            address::SAVEUSER => self.cmd_save_user(args),
            address::DELUSER => self.cmd_delete::<User>(&args),
            address::SAVEVIEW => self.cmd_save_view(args),
            address::DELVIEW => self.cmd_delete::<View>(&args),
            address::VIEW_CONNECT => self.cmd_view_connect(&args),
            address::VIEW_DISCONNECT => self.cmd_view_disconnect(&args),
            address::SERVE_CONNECTORS => self.cmd_serve_connectors(&args),
            address::DEVICE_SAVE => self
                .manager_uid(uid.as_deref())
                .and_then(|m| self.cmd_device_save(&m, args)),
            address::DEVICE_DEL => self
                .manager_uid(uid.as_deref())
                .and_then(|m| self.cmd_device_del(&m)),
            address::DEVICE_SEARCH => self
                .manager_uid(uid.as_deref())
                .and_then(|m| self.cmd_device_search(&m, &args)),
            other => Err(ServiceError::bad_request(format!("unknown command {other}"))),
        };

        match (result, uid) {
            (Ok(extra), Some(uid)) => self.reply(&uid, ConfirmCode::Ok, "", extra),
            (Ok(_), None) => {}
            (Err(e), uid) => {
                warn!("{} rejected: {}", command, e);
                if let Some(uid) = uid {
                    self.reply(&uid, e.confirm_code(), &e.to_string(), Vec::new());
                }
            }
        }
        true
    }

    fn reply(&self, uid: &str, code: ConfirmCode, message: &str, extra: Vec<Arg>) {
        if let Err(e) = self.transport.reply(uid, code, message, extra) {
            warn!("Cannot confirm {}: {}", uid, e);
        }
    }

    /// Saves and deletes need the whole fleet stopped
    fn ensure_stopped(&self) -> Result<()> {
        if self.managers.values().all(|m| m.is_stopped()) {
            Ok(())
        } else {
            Err(ServiceError::NotStopped)
        }
    }

    fn manager_uid(&self, uid: Option<&str>) -> Result<Uid> {
        let uid = uid.ok_or_else(|| ServiceError::bad_request("missing manager uid"))?;
        self.managers
            .keys()
            .find(|k| k.as_str() == uid)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownManager(uid.to_string()))
    }

    fn add_manager(&mut self, device: Device) -> Result<Uid> {
        let kind = self
            .registry
            .get(&device.kind)
            .ok_or_else(|| ServiceError::UnknownDeviceType(device.kind.clone()))?;
        let uid = Uid::generate();
        let manager = DeviceManager::new(uid.clone(), device, kind)
            .with_timeouts(self.config.timeouts.clone())
            .with_derivator_config(self.config.derivator.clone());
        self.managers.insert(uid.clone(), manager);
        Ok(uid)
    }

    /// Managers of enabled devices referenced by an active view, in device order
    fn active_device_uids(&self) -> Result<Vec<Uid>> {
        let mut ids: Vec<i64> = Vec::new();
        for view in self.db.load_all::<View>()? {
            if view.active {
                for id in view.connected_devices() {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
        }
        let mut uids: Vec<(&DeviceManager, Uid)> = self
            .managers
            .iter()
            .filter(|(_, m)| m.device().enabled)
            .filter(|(_, m)| m.device().id.map_or(false, |id| ids.contains(&id)))
            .map(|(uid, m)| (m, uid.clone()))
            .collect();
        uids.sort_by_key(|(m, _)| (m.device().order, m.device().id));
        Ok(uids.into_iter().map(|(_, uid)| uid).collect())
    }

    fn cmd_loglevel(&self, args: &[Arg]) -> Result<Vec<Arg>> {
        let level = str_arg(args, 0, "log level")?;
        match &self.log_control {
            Some(control) => control.set_level(level)?,
            None => return Err(ServiceError::bad_request("log level is fixed")),
        }
        info!("Log level set to {}", level);
        Ok(Vec::new())
    }

    fn cmd_new_device(&mut self, args: &[Arg]) -> Result<Vec<Arg>> {
        let kind = str_arg(args, 0, "device type")?;
        let uid = self.add_manager(Device::new(kind, ""))?;
        info!("New {} manager {}", kind, uid);
        Ok(vec![Arg::from(uid.as_str())])
    }

    fn cmd_list_devices(&self, corr: Option<&str>) -> Result<Vec<Arg>> {
        let mut listed: Vec<(&Uid, &DeviceManager)> = self.managers.iter().collect();
        listed.sort_by_key(|(_, m)| (m.device().order, m.device().id));
        for (uid, m) in &listed {
            let info = serde_json::to_string(m.info()).map_err(FitError::from)?;
            let args = vec![
                Arg::from(uid.as_str()),
                Arg::from(Record::Device(m.device().clone())),
                Arg::from(m.state().code()),
                Arg::from(m.reason().code()),
                Arg::from(info),
            ];
            self.send_listing(address::LISTDEVICES_RV, corr, args);
        }
        Ok(vec![Arg::from(listed.len() as i64)])
    }

    fn cmd_list<E>(&self, rv: &str, corr: Option<&str>) -> Result<Vec<Arg>>
    where
        E: Entity,
        Record: From<E>,
    {
        let items = self.db.load_all::<E>()?;
        let count = items.len();
        for item in items {
            self.send_listing(rv, corr, vec![Arg::from(Record::from(item))]);
        }
        Ok(vec![Arg::from(count as i64)])
    }

    fn send_listing(&self, rv: &str, corr: Option<&str>, args: Vec<Arg>) {
        let sent = match corr {
            Some(corr) => self.transport.send_device(rv, corr, args),
            None => self.transport.send(rv, args),
        };
        if let Err(e) = sent {
            warn!("Cannot send {}: {}", rv, e);
        }
    }

    fn cmd_save_user(&mut self, args: Vec<Arg>) -> Result<Vec<Arg>> {
        self.ensure_stopped()?;
        let mut user: User = entity_arg(args, "user")?;
        self.db.save_or_rollback(&mut user)?;
        info!("Saved user {:?}", user.id);
        Ok(vec![Arg::from(Record::User(user))])
    }

    fn cmd_save_view(&mut self, args: Vec<Arg>) -> Result<Vec<Arg>> {
        self.ensure_stopped()?;
        let mut view: View = entity_arg(args, "view")?;
        for device in view.connected_devices() {
            if self.db.load_by_id::<Device>(device)?.is_none() {
                return Err(ServiceError::bad_request(format!(
                    "label refers to unknown device {device}"
                )));
            }
        }
        self.db.save_or_rollback(&mut view)?;
        info!("Saved view {:?}", view.id);
        Ok(vec![Arg::from(Record::View(view))])
    }

    fn cmd_delete<E>(&mut self, args: &[Arg]) -> Result<Vec<Arg>>
    where
        E: Entity + TryFrom<Record, Error = Record>,
    {
        self.ensure_stopped()?;
        let id = id_arg::<E>(args)?;
        let entity = self
            .db
            .load_by_id::<E>(id)?
            .ok_or_else(|| FitError::NotFound(format!("{} {}", E::CLASS, id)))?;
        self.db.remove(&entity, true)?;
        info!("Deleted {} {}", E::CLASS, id);
        Ok(Vec::new())
    }

    fn cmd_view_connect(&mut self, args: &[Arg]) -> Result<Vec<Arg>> {
        let user_id = args
            .first()
            .and_then(Arg::as_i64)
            .ok_or_else(|| ServiceError::bad_request("missing user id"))?;
        let user = self
            .db
            .load_by_id::<User>(user_id)?
            .ok_or_else(|| FitError::NotFound(format!("User {user_id}")))?;

        let mut views = Vec::new();
        for arg in &args[1..] {
            let id = arg
                .as_i64()
                .ok_or_else(|| ServiceError::bad_request("view ids must be integers"))?;
            let view = self
                .db
                .load_by_id::<View>(id)?
                .ok_or_else(|| FitError::NotFound(format!("View {id}")))?;
            views.push(view);
        }
        for view in &mut views {
            view.active = true;
            self.db.save(view, false)?;
        }
        self.db.commit()?;

        let uids = self.active_device_uids()?;
        let count = uids.len();
        info!("Connecting {} devices for {}", count, user.name);
        self.drive_fleet(|fleet, pool| fleet.connect(uids, Some(user), pool));
        Ok(vec![Arg::from(count as i64)])
    }

    fn cmd_view_disconnect(&mut self, args: &[Arg]) -> Result<Vec<Arg>> {
        let only: Vec<i64> = args.iter().filter_map(Arg::as_i64).collect();
        for mut view in self.db.load_all::<View>()? {
            let selected = only.is_empty() || view.id.map_or(false, |id| only.contains(&id));
            if view.active && selected {
                view.active = false;
                self.db.save(&mut view, false)?;
            }
        }
        self.db.commit()?;

        let live: Vec<Uid> = self
            .managers
            .iter()
            .filter(|(_, m)| !m.is_stopped())
            .map(|(uid, _)| uid.clone())
            .collect();
        let count = live.len();
        info!("Disconnecting {} devices", count);
        self.drive_fleet(|fleet, pool| fleet.disconnect(live, pool));
        Ok(vec![Arg::from(count as i64)])
    }

    fn cmd_serve_connectors(&mut self, args: &[Arg]) -> Result<Vec<Arg>> {
        let list = match args.first() {
            Some(arg) => ConnectorConfig::parse_list(
                arg.as_str()
                    .ok_or_else(|| ServiceError::bad_request("connector list must be a string"))?,
            )?,
            None => Vec::new(),
        };
        let count = list.len();
        self.connectors.serve(list);
        Ok(vec![Arg::from(count as i64)])
    }

    fn cmd_device_save(&mut self, uid: &Uid, args: Vec<Arg>) -> Result<Vec<Arg>> {
        self.ensure_stopped()?;
        let mut device: Device = entity_arg(args, "device")?;
        let current = self
            .managers
            .get(uid)
            .ok_or_else(|| ServiceError::UnknownManager(uid.to_string()))?
            .device();
        device.kind = current.kind.clone();
        if current.id.is_some() {
            device.id = current.id;
        }
        self.db.save_or_rollback(&mut device)?;
        if let Some(manager) = self.managers.get_mut(uid) {
            manager.set_device(device.clone())?;
        }
        info!("Saved device {} ({})", device.alias, uid);
        Ok(vec![Arg::from(Record::Device(device))])
    }

    fn cmd_device_del(&mut self, uid: &Uid) -> Result<Vec<Arg>> {
        self.ensure_stopped()?;
        let device = self
            .managers
            .get(uid)
            .map(|m| m.device().clone())
            .ok_or_else(|| ServiceError::UnknownManager(uid.to_string()))?;

        if let Some(id) = device.id {
            if let Err(e) = self.remove_device_rows(&device, id) {
                if let Err(rollback) = self.db.rollback() {
                    error!("Rollback failed: {}", rollback);
                }
                return Err(e);
            }
        }
        self.managers.remove(uid);
        self.fleet.forget(uid);
        info!("Deleted device {} ({})", device.alias, uid);
        Ok(Vec::new())
    }

    fn remove_device_rows(&self, device: &Device, id: i64) -> Result<()> {
        for mut view in self.db.load_all::<View>()? {
            if view.prune_device(id) {
                self.db.save(&mut view, false)?;
            }
        }
        self.db.remove(device, false)?;
        self.db.commit()?;
        Ok(())
    }

    fn cmd_device_search(&mut self, uid: &Uid, args: &[Arg]) -> Result<Vec<Arg>> {
        let start = args
            .first()
            .map(|a| a.as_bool().or_else(|| a.as_i64().map(|v| v != 0)))
            .unwrap_or(Some(true))
            .ok_or_else(|| ServiceError::bad_request("search flag must be a bool"))?;
        if start {
            self.ensure_stopped()?;
        }
        let effects = match self.managers.get_mut(uid) {
            Some(manager) => manager.search(start)?,
            None => return Err(ServiceError::UnknownManager(uid.to_string())),
        };
        self.apply(effects.into_iter().map(|e| (uid.clone(), e)).collect());
        Ok(Vec::new())
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Driver worker; calls leave in the order the managers issued them
async fn issue_calls(
    driver: Arc<dyn BleDriver>,
    mut calls: mpsc::UnboundedReceiver<(Uid, DriverCall)>,
    events: mpsc::UnboundedSender<ServiceEvent>,
) {
    while let Some((uid, call)) = calls.recv().await {
        let address = call.address().map(str::to_string);
        if let Err(e) = call.invoke(driver.as_ref()).await {
            warn!("{}: driver call failed: {}", uid, e);
            let event = DriverEvent::OperationFailed {
                address,
                reason: e.reason(),
                message: e.to_string(),
            };
            let _ = events.send(ServiceEvent::DriverFailed { uid, event });
        }
    }
}

fn sample_record(sample: &Sample) -> Record {
    match sample {
        Sample::Hr(s) => Record::from(s.clone()),
        Sample::Keiser(s) => Record::from(s.clone()),
    }
}

fn str_arg<'a>(args: &'a [Arg], index: usize, what: &str) -> Result<&'a str> {
    args.get(index)
        .and_then(Arg::as_str)
        .ok_or_else(|| ServiceError::bad_request(format!("missing {what}")))
}

fn entity_arg<E>(args: Vec<Arg>, what: &str) -> Result<E>
where
    E: TryFrom<Record, Error = Record>,
{
    args.into_iter()
        .next()
        .and_then(Arg::into_entity)
        .ok_or_else(|| ServiceError::bad_request(format!("expected a {what}")))
}

/// An entity id, given either as an integer or as the entity itself
fn id_arg<E>(args: &[Arg]) -> Result<i64>
where
    E: Entity + TryFrom<Record, Error = Record>,
{
    let arg = args
        .first()
        .ok_or_else(|| ServiceError::bad_request(format!("missing {} id", E::CLASS)))?;
    if let Some(id) = arg.as_i64() {
        return Ok(id);
    }
    arg.clone()
        .into_entity::<E>()
        .and_then(|e| e.id())
        .ok_or_else(|| ServiceError::bad_request(format!("expected a saved {}", E::CLASS)))
}
