//! Fleet coordinator
//!
//! Sequences connect and disconnect operations over the active managers, one
//! at a time and in device order, retrying failed connects with backoff. The
//! coordinator reaches managers only through a [`ManagerPool`] keyed by uid.

use std::collections::HashMap;
use std::time::Duration;

use fitbridge_core::{DeviceState, DisconnectReason, FleetConfig, Uid, User};
use tracing::{debug, info, warn};

use crate::error::Result;

// ----------------------------------------------------------------------------
// Manager Pool
// ----------------------------------------------------------------------------

/// Lookup and control of managers by uid
pub trait ManagerPool {
    fn state(&self, uid: &Uid) -> Option<DeviceState>;

    /// `(Device.order, Device.id)`, lower connects first
    fn sort_key(&self, uid: &Uid) -> (i64, i64);

    /// Bind `user` and start connecting; fails when the manager is busy
    fn connect(&mut self, uid: &Uid, user: Option<&User>) -> Result<()>;

    fn disconnect(&mut self, uid: &Uid);

    fn set_main_session(&mut self, uid: &Uid, main_id: Option<i64>);
}

// ----------------------------------------------------------------------------
// Coordinator
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    #[default]
    None,
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperationInfo {
    pub operation: Operation,
    pub retry: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FleetEffect {
    /// Call back `on_timer(generation)` after `after`
    ArmTimer { after: Duration, generation: u64 },
    /// Operator-visible message
    PrintMsg(String),
}

pub struct FleetCoordinator {
    config: FleetConfig,
    active: Vec<Uid>,
    done: Vec<Uid>,
    info: HashMap<Uid, OperationInfo>,
    timer: Option<u64>,
    next_generation: u64,
    last_user: Option<User>,
    main_session: Option<i64>,
}

impl FleetCoordinator {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            config,
            active: Vec::new(),
            done: Vec::new(),
            info: HashMap::new(),
            timer: None,
            next_generation: 0,
            last_user: None,
            main_session: None,
        }
    }

    pub fn active(&self) -> &[Uid] {
        &self.active
    }

    pub fn done(&self) -> &[Uid] {
        &self.done
    }

    pub fn info(&self, uid: &Uid) -> OperationInfo {
        self.info.get(uid).copied().unwrap_or_default()
    }

    pub fn main_session(&self) -> Option<i64> {
        self.main_session
    }

    pub fn last_user(&self) -> Option<&User> {
        self.last_user.as_ref()
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Connect `uids` in device order for `user`
    pub fn connect(
        &mut self,
        uids: Vec<Uid>,
        user: Option<User>,
        pool: &mut dyn ManagerPool,
    ) -> Vec<FleetEffect> {
        self.last_user = user;
        self.plan(uids, Operation::Connect, pool);
        self.run_pending(false, pool)
    }

    /// Disconnect `uids`, one at a time
    pub fn disconnect(&mut self, uids: Vec<Uid>, pool: &mut dyn ManagerPool) -> Vec<FleetEffect> {
        self.plan(uids, Operation::Disconnect, pool);
        self.run_pending(false, pool)
    }

    fn plan(&mut self, uids: Vec<Uid>, operation: Operation, pool: &dyn ManagerPool) {
        self.active.clear();
        self.done.clear();
        self.info.clear();
        for uid in uids {
            if !self.active.contains(&uid) {
                self.info.insert(uid.clone(), OperationInfo { operation, retry: 0 });
                self.active.push(uid);
            }
        }
        self.sort(pool);
        info!("Fleet plan: {:?} {} managers", operation, self.active.len());
    }

    /// Drop a manager that no longer exists
    pub fn forget(&mut self, uid: &Uid) {
        self.active.retain(|u| u != uid);
        self.done.retain(|u| u != uid);
        self.info.remove(uid);
    }

    /// Advance the plan as far as it can go without waiting
    pub fn run_pending(&mut self, by_timer: bool, pool: &mut dyn ManagerPool) -> Vec<FleetEffect> {
        let mut effects = Vec::new();
        // clearing the reference cancels a pending timer: its generation no longer matches
        self.timer = None;

        let mut i = 0;
        while i < self.active.len() {
            let uid = self.active[i].clone();
            let Some(state) = pool.state(&uid) else {
                self.forget(&uid);
                continue;
            };
            let info = self.info.entry(uid.clone()).or_default();

            match info.operation {
                Operation::Disconnect => {
                    if state.is_transient() {
                        break;
                    }
                    if state.is_stopped() {
                        info.operation = Operation::None;
                        self.finish(i);
                        continue;
                    }
                    pool.disconnect(&uid);
                    break;
                }
                Operation::Connect => {
                    if state.is_connected() {
                        info.operation = Operation::None;
                        self.finish(i);
                        continue;
                    }
                    if state.is_transient() {
                        break;
                    }
                    if by_timer {
                        pool.set_main_session(&uid, self.main_session);
                        match pool.connect(&uid, self.last_user.as_ref()) {
                            Ok(()) => break,
                            Err(e) => {
                                warn!("Manager {} refused to connect: {}", uid, e);
                                effects.push(FleetEffect::PrintMsg(format!(
                                    "Cannot connect {uid}: {e}"
                                )));
                                i += 1;
                                continue;
                            }
                        }
                    }
                    if info.retry >= self.config.connect_retry {
                        info.operation = Operation::None;
                        effects.push(FleetEffect::PrintMsg(format!(
                            "Giving up on {uid} after {} attempts",
                            info.retry
                        )));
                        self.finish(i);
                        continue;
                    }
                    let secs = if info.retry == 0 {
                        0
                    } else {
                        self.config.connect_secs
                    };
                    info.retry += 1;
                    debug!("Connect attempt {} for {} in {}s", info.retry, uid, secs);
                    effects.push(self.arm(Duration::from_secs(secs)));
                    break;
                }
                Operation::None => {
                    self.finish(i);
                }
            }
        }
        effects
    }

    /// A timer armed by [`run_pending`](Self::run_pending) fired
    pub fn on_timer(&mut self, generation: u64, pool: &mut dyn ManagerPool) -> Vec<FleetEffect> {
        if self.timer != Some(generation) {
            return Vec::new();
        }
        self.run_pending(true, pool)
    }

    /// React to a manager state transition
    pub fn on_state_change(
        &mut self,
        uid: &Uid,
        old: DeviceState,
        new: DeviceState,
        reason: DisconnectReason,
        pool: &mut dyn ManagerPool,
    ) -> Vec<FleetEffect> {
        let tracked = self.active.contains(uid) || self.done.contains(uid);
        if !tracked {
            return Vec::new();
        }

        if new == DeviceState::Disconnected && reason.is_fatal() && !self.active.is_empty() {
            return self.abort(reason);
        }

        match (old, new) {
            (DeviceState::Connecting, n) if n.is_connected() => {
                if let Some(info) = self.info.get_mut(uid) {
                    info.retry = 0;
                }
                self.run_pending(false, pool)
            }
            (DeviceState::Connecting, DeviceState::Disconnected) => self.run_pending(false, pool),
            (o, DeviceState::Disconnected) if o.is_connected() || o == DeviceState::Disconnecting => {
                let operation = self.info(uid).operation;
                // a connect that timed out tears down through DISCONNECTING and keeps its retry count
                let pending_connect = !o.is_connected()
                    && operation == Operation::Connect
                    && self.active.contains(uid);
                if pending_connect {
                    return self.run_pending(false, pool);
                }
                if reason != DisconnectReason::Requested && operation != Operation::Disconnect {
                    info!("Manager {} dropped ({}), reconnecting", uid, reason);
                    self.requeue(uid, pool);
                    return self.run_pending(false, pool);
                }
                let effects = self.run_pending(false, pool);
                self.clear_main_session_if_stopped(pool);
                effects
            }
            _ => Vec::new(),
        }
    }

    /// Publish the first opened session as the fleet's main session
    pub fn on_session_opened(&mut self, session_id: i64, pool: &mut dyn ManagerPool) {
        if self.main_session.is_some() {
            return;
        }
        info!("Main session is {}", session_id);
        self.main_session = Some(session_id);
        for uid in self.active.iter().chain(self.done.iter()) {
            pool.set_main_session(uid, self.main_session);
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn finish(&mut self, index: usize) {
        let uid = self.active.remove(index);
        if !self.done.contains(&uid) {
            self.done.push(uid);
        }
    }

    fn arm(&mut self, after: Duration) -> FleetEffect {
        self.next_generation += 1;
        self.timer = Some(self.next_generation);
        FleetEffect::ArmTimer {
            after,
            generation: self.next_generation,
        }
    }

    fn abort(&mut self, reason: DisconnectReason) -> Vec<FleetEffect> {
        warn!("Fleet plan aborted: {}", reason);
        self.timer = None;
        for uid in std::mem::take(&mut self.active) {
            if let Some(info) = self.info.get_mut(&uid) {
                info.operation = Operation::None;
            }
            if !self.done.contains(&uid) {
                self.done.push(uid);
            }
        }
        vec![FleetEffect::PrintMsg(format!("Connection plan aborted: {reason}"))]
    }

    fn requeue(&mut self, uid: &Uid, pool: &dyn ManagerPool) {
        self.done.retain(|u| u != uid);
        if !self.active.contains(uid) {
            self.active.push(uid.clone());
        }
        self.info.insert(
            uid.clone(),
            OperationInfo {
                operation: Operation::Connect,
                retry: 0,
            },
        );
        self.sort(pool);
    }

    fn sort(&mut self, pool: &dyn ManagerPool) {
        self.active.sort_by_key(|uid| pool.sort_key(uid));
    }

    fn clear_main_session_if_stopped(&mut self, pool: &mut dyn ManagerPool) {
        if self.main_session.is_none() {
            return;
        }
        let all_stopped = self
            .active
            .iter()
            .chain(self.done.iter())
            .all(|uid| pool.state(uid).map_or(true, DeviceState::is_stopped));
        if all_stopped {
            debug!("Fleet stopped, main session {:?} closed", self.main_session);
            self.main_session = None;
            for uid in self.active.iter().chain(self.done.iter()) {
                pool.set_main_session(uid, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;

    /// Pool whose managers change state only when a test says so
    #[derive(Default)]
    struct FakePool {
        managers: HashMap<Uid, (DeviceState, i64)>,
        connects: Vec<Uid>,
        disconnects: Vec<Uid>,
        main: HashMap<Uid, Option<i64>>,
    }

    impl FakePool {
        fn add(&mut self, order: i64) -> Uid {
            let uid = Uid::generate();
            self.managers.insert(uid.clone(), (DeviceState::Disconnected, order));
            uid
        }

        fn set(&mut self, uid: &Uid, state: DeviceState) -> DeviceState {
            let entry = self.managers.get_mut(uid).unwrap();
            std::mem::replace(&mut entry.0, state)
        }
    }

    impl ManagerPool for FakePool {
        fn state(&self, uid: &Uid) -> Option<DeviceState> {
            self.managers.get(uid).map(|m| m.0)
        }

        fn sort_key(&self, uid: &Uid) -> (i64, i64) {
            (self.managers.get(uid).map_or(i64::MAX, |m| m.1), 0)
        }

        fn connect(&mut self, uid: &Uid, _user: Option<&User>) -> Result<()> {
            let state = self.state(uid).unwrap();
            if !state.is_stopped() {
                return Err(ServiceError::NotStopped);
            }
            self.connects.push(uid.clone());
            self.set(uid, DeviceState::Connecting);
            Ok(())
        }

        fn disconnect(&mut self, uid: &Uid) {
            self.disconnects.push(uid.clone());
            self.set(uid, DeviceState::Disconnecting);
        }

        fn set_main_session(&mut self, uid: &Uid, main_id: Option<i64>) {
            self.main.insert(uid.clone(), main_id);
        }
    }

    fn timer_of(effects: &[FleetEffect]) -> (Duration, u64) {
        match effects {
            [FleetEffect::ArmTimer { after, generation }] => (*after, *generation),
            other => panic!("expected one timer, got {other:?}"),
        }
    }

    fn transition(
        fleet: &mut FleetCoordinator,
        pool: &mut FakePool,
        uid: &Uid,
        new: DeviceState,
        reason: DisconnectReason,
    ) -> Vec<FleetEffect> {
        let old = pool.set(uid, new);
        fleet.on_state_change(uid, old, new, reason, pool)
    }

    #[test]
    fn test_connect_with_retry_follows_device_order() {
        let mut pool = FakePool::default();
        let late = pool.add(10);
        let early = pool.add(5);
        let mut fleet = FleetCoordinator::new(FleetConfig::default());

        // first attempt is immediate
        let effects = fleet.connect(vec![late.clone(), early.clone()], None, &mut pool);
        assert_eq!(fleet.active(), &[early.clone(), late.clone()]);
        let (after, generation) = timer_of(&effects);
        assert_eq!(after, Duration::ZERO);
        assert!(fleet.on_timer(generation, &mut pool).is_empty());
        assert_eq!(pool.connects, vec![early.clone()]);

        // connect fails, retry after connect_secs
        let effects = transition(
            &mut fleet,
            &mut pool,
            &early,
            DeviceState::Disconnected,
            DisconnectReason::OperationError,
        );
        let (after, generation) = timer_of(&effects);
        assert_eq!(after, Duration::from_secs(5));
        fleet.on_timer(generation, &mut pool);
        assert_eq!(pool.connects, vec![early.clone(), early.clone()]);

        // success moves on to the next device
        let effects = transition(
            &mut fleet,
            &mut pool,
            &early,
            DeviceState::Connected,
            DisconnectReason::StateChange,
        );
        assert_eq!(fleet.done(), &[early.clone()]);
        let (after, generation) = timer_of(&effects);
        assert_eq!(after, Duration::ZERO);
        fleet.on_timer(generation, &mut pool);
        assert_eq!(pool.connects.last(), Some(&late));

        transition(
            &mut fleet,
            &mut pool,
            &late,
            DeviceState::Connected,
            DisconnectReason::StateChange,
        );
        assert!(fleet.active().is_empty());
        assert!(!fleet.has_timer());
    }

    #[test]
    fn test_stale_timer_is_ignored() {
        let mut pool = FakePool::default();
        let uid = pool.add(1);
        let mut fleet = FleetCoordinator::new(FleetConfig::default());
        let (_, first) = timer_of(&fleet.connect(vec![uid.clone()], None, &mut pool));
        let (_, second) = timer_of(&fleet.run_pending(false, &mut pool));
        assert_ne!(first, second);
        assert!(fleet.on_timer(first, &mut pool).is_empty());
        assert!(pool.connects.is_empty());
    }

    #[test]
    fn test_gives_up_after_connect_retry_attempts() {
        let mut pool = FakePool::default();
        let uid = pool.add(1);
        let mut fleet = FleetCoordinator::new(FleetConfig::default().with_connect_retry(2));
        let mut effects = fleet.connect(vec![uid.clone()], None, &mut pool);
        for _ in 0..2 {
            let (_, generation) = timer_of(&effects);
            fleet.on_timer(generation, &mut pool);
            effects = transition(
                &mut fleet,
                &mut pool,
                &uid,
                DeviceState::Disconnected,
                DisconnectReason::OperationError,
            );
        }
        assert!(matches!(effects.as_slice(), [FleetEffect::PrintMsg(_)]));
        assert!(fleet.active().is_empty());
        assert_eq!(pool.connects.len(), 2);
    }

    #[test]
    fn test_unsolicited_drop_requeues() {
        let mut pool = FakePool::default();
        let uid = pool.add(1);
        let mut fleet = FleetCoordinator::new(FleetConfig::default());
        let (_, generation) = timer_of(&fleet.connect(vec![uid.clone()], None, &mut pool));
        fleet.on_timer(generation, &mut pool);
        transition(&mut fleet, &mut pool, &uid, DeviceState::Connected, DisconnectReason::StateChange);
        transition(&mut fleet, &mut pool, &uid, DeviceState::Online, DisconnectReason::Simulator);
        assert_eq!(fleet.done(), &[uid.clone()]);

        let effects = transition(
            &mut fleet,
            &mut pool,
            &uid,
            DeviceState::Disconnected,
            DisconnectReason::Timeout,
        );
        assert_eq!(fleet.active(), &[uid.clone()]);
        assert_eq!(fleet.info(&uid).operation, Operation::Connect);
        assert_eq!(timer_of(&effects).0, Duration::ZERO);
    }

    #[test]
    fn test_connect_timeout_counts_against_retry() {
        let mut pool = FakePool::default();
        let uid = pool.add(1);
        let config = FleetConfig::default().with_connect_retry(2);
        let secs = config.connect_secs;
        let mut fleet = FleetCoordinator::new(config);

        let mut delays = Vec::new();
        let mut effects = fleet.connect(vec![uid.clone()], None, &mut pool);
        while let [FleetEffect::ArmTimer { after, generation }] = effects.as_slice() {
            delays.push(after.as_secs());
            let generation = *generation;
            assert!(fleet.on_timer(generation, &mut pool).is_empty());
            assert_eq!(pool.state(&uid), Some(DeviceState::Connecting));
            // scan window expired without finding the device
            let stalled = transition(
                &mut fleet,
                &mut pool,
                &uid,
                DeviceState::Disconnecting,
                DisconnectReason::Timeout,
            );
            assert!(stalled.is_empty());
            effects = transition(
                &mut fleet,
                &mut pool,
                &uid,
                DeviceState::Disconnected,
                DisconnectReason::Timeout,
            );
            assert!(pool.connects.len() <= 2, "kept retrying: {:?}", pool.connects);
        }

        assert_eq!(delays, vec![0, secs]);
        assert_eq!(pool.connects.len(), 2);
        assert!(matches!(effects.as_slice(), [FleetEffect::PrintMsg(m)] if m.starts_with("Giving up")));
        assert!(fleet.active().is_empty());
        assert_eq!(fleet.info(&uid).operation, Operation::None);
    }

    #[test]
    fn test_drop_after_disconnecting_connected_manager_requeues() {
        let mut pool = FakePool::default();
        let uid = pool.add(1);
        let mut fleet = FleetCoordinator::new(FleetConfig::default().with_connect_retry(1));
        let (_, generation) = timer_of(&fleet.connect(vec![uid.clone()], None, &mut pool));
        fleet.on_timer(generation, &mut pool);
        transition(&mut fleet, &mut pool, &uid, DeviceState::Idle, DisconnectReason::StateChange);
        assert_eq!(fleet.done(), &[uid.clone()]);

        // silence timeout on a connected manager
        transition(&mut fleet, &mut pool, &uid, DeviceState::Disconnecting, DisconnectReason::Timeout);
        let effects = transition(
            &mut fleet,
            &mut pool,
            &uid,
            DeviceState::Disconnected,
            DisconnectReason::Timeout,
        );
        assert_eq!(fleet.active(), &[uid.clone()]);
        assert_eq!(fleet.info(&uid).retry, 1);
        assert_eq!(timer_of(&effects).0, Duration::ZERO);
    }

    #[test]
    fn test_fatal_reason_aborts_plan() {
        let mut pool = FakePool::default();
        let a = pool.add(1);
        let b = pool.add(2);
        let mut fleet = FleetCoordinator::new(FleetConfig::default());
        let (_, generation) = timer_of(&fleet.connect(vec![a.clone(), b.clone()], None, &mut pool));
        fleet.on_timer(generation, &mut pool);

        let effects = transition(
            &mut fleet,
            &mut pool,
            &a,
            DeviceState::Disconnected,
            DisconnectReason::BleDisabled,
        );
        assert!(matches!(effects.as_slice(), [FleetEffect::PrintMsg(_)]));
        assert!(fleet.active().is_empty());
        assert_eq!(fleet.info(&b).operation, Operation::None);
        assert!(!fleet.has_timer());
    }

    #[test]
    fn test_disconnect_plan_runs_one_at_a_time() {
        let mut pool = FakePool::default();
        let a = pool.add(1);
        let b = pool.add(2);
        let idle = pool.add(3);
        pool.set(&a, DeviceState::Online);
        pool.set(&b, DeviceState::Idle);
        let mut fleet = FleetCoordinator::new(FleetConfig::default());
        fleet.on_session_opened(42, &mut pool);

        let effects = fleet.disconnect(vec![a.clone(), b.clone(), idle.clone()], &mut pool);
        assert!(effects.is_empty());
        assert_eq!(pool.disconnects, vec![a.clone()]);

        transition(&mut fleet, &mut pool, &a, DeviceState::Disconnected, DisconnectReason::Requested);
        assert_eq!(pool.disconnects, vec![a.clone(), b.clone()]);
        transition(&mut fleet, &mut pool, &b, DeviceState::Disconnected, DisconnectReason::Requested);
        assert!(fleet.active().is_empty());
        assert_eq!(fleet.done(), &[a, b, idle]);
    }

    #[test]
    fn test_main_session_published_once_and_cleared_on_stop() {
        let mut pool = FakePool::default();
        let a = pool.add(1);
        let b = pool.add(2);
        let mut fleet = FleetCoordinator::new(FleetConfig::default());
        let (_, generation) = timer_of(&fleet.connect(vec![a.clone(), b.clone()], None, &mut pool));
        fleet.on_timer(generation, &mut pool);

        fleet.on_session_opened(7, &mut pool);
        fleet.on_session_opened(8, &mut pool);
        assert_eq!(fleet.main_session(), Some(7));
        assert_eq!(pool.main.get(&a), Some(&Some(7)));
        assert_eq!(pool.main.get(&b), Some(&Some(7)));

        transition(&mut fleet, &mut pool, &a, DeviceState::Connected, DisconnectReason::StateChange);
        let (_, generation) = timer_of(&fleet.run_pending(false, &mut pool));
        fleet.on_timer(generation, &mut pool);
        transition(&mut fleet, &mut pool, &b, DeviceState::Connected, DisconnectReason::StateChange);

        fleet.disconnect(vec![a.clone(), b.clone()], &mut pool);
        transition(&mut fleet, &mut pool, &a, DeviceState::Disconnected, DisconnectReason::Requested);
        assert_eq!(fleet.main_session(), Some(7));
        transition(&mut fleet, &mut pool, &b, DeviceState::Disconnected, DisconnectReason::Requested);
        assert_eq!(fleet.main_session(), None);
        assert_eq!(pool.main.get(&b), Some(&None));
    }
}
