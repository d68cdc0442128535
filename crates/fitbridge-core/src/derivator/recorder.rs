use tracing::{debug, warn};

use super::StepState;
use crate::errors::Result;
use crate::model::{Sample, Session};
use crate::storage::Database;

// ----------------------------------------------------------------------------
// Sample Store
// ----------------------------------------------------------------------------

/// Persistence hooks used while recording
pub trait SampleStore {
    fn insert_session(&self, session: &mut Session) -> Result<()>;
    fn update_session(&self, session: &mut Session) -> Result<()>;
    fn insert_sample(&self, sample: &mut Sample) -> Result<()>;
    fn commit(&self) -> Result<()>;
}

impl SampleStore for Database {
    fn insert_session(&self, session: &mut Session) -> Result<()> {
        session.id = None;
        self.save(session, false)
    }

    fn update_session(&self, session: &mut Session) -> Result<()> {
        self.save(session, false)
    }

    fn insert_sample(&self, sample: &mut Sample) -> Result<()> {
        match sample {
            Sample::Hr(s) => self.save(s, false),
            Sample::Keiser(s) => self.save(s, false),
        }
    }

    fn commit(&self) -> Result<()> {
        Database::commit(self)
    }
}

// ----------------------------------------------------------------------------
// Session Recorder
// ----------------------------------------------------------------------------

/// Opens the session, writes samples and coalesces commits
#[derive(Debug)]
pub struct SessionRecorder {
    device: i64,
    user: i64,
    commit_interval_ms: i64,
    session: Option<Session>,
    main_id: Option<i64>,
    last_commit_ms: Option<i64>,
    last_state: Option<StepState>,
    opened: bool,
    dirty: bool,
}

impl SessionRecorder {
    pub fn new(device: i64, user: i64, commit_interval_ms: i64) -> Self {
        Self {
            device,
            user,
            commit_interval_ms,
            session: None,
            main_id: None,
            last_commit_ms: None,
            last_state: None,
            opened: false,
            dirty: false,
        }
    }

    pub fn set_main_session(&mut self, main_id: Option<i64>) {
        self.main_id = main_id;
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub(crate) fn take_opened(&mut self) -> Option<Session> {
        if std::mem::take(&mut self.opened) {
            self.session.clone()
        } else {
            None
        }
    }

    /// Persist one derived sample
    pub fn record(&mut self, sample: &mut Sample, state: StepState, now_ms: i64, store: &dyn SampleStore) {
        let session_id = match self.ensure_session(now_ms, store) {
            Some(id) => id,
            None => return,
        };

        sample.clear_id();
        sample.set_session(Some(session_id));
        match store.insert_sample(sample) {
            Ok(()) => self.dirty = true,
            Err(e) => warn!("Failed to write sample for session {}: {}", session_id, e),
        }

        let leaving_span = self.last_state == Some(StepState::Online) && state != StepState::Online;
        let due = self
            .last_commit_ms
            .map_or(true, |last| now_ms - last >= self.commit_interval_ms);
        if leaving_span || due {
            self.flush(now_ms, store);
        }
        self.last_state = Some(state);
    }

    /// Commit anything still pending
    pub fn finish(&mut self, store: &dyn SampleStore) {
        if self.dirty {
            let now = self.last_commit_ms.unwrap_or_default();
            self.flush(now, store);
        }
        self.last_state = None;
    }

    fn ensure_session(&mut self, now_ms: i64, store: &dyn SampleStore) -> Option<i64> {
        if let Some(session) = self.session.as_mut() {
            if self.main_id.is_some() && session.main_id != self.main_id {
                session.main_id = self.main_id;
                match store.update_session(session) {
                    Ok(()) => self.dirty = true,
                    Err(e) => warn!("Failed to chain session {:?}: {}", session.id, e),
                }
            }
            return session.id;
        }

        let mut session = Session::new(self.device, self.user, now_ms);
        session.main_id = self.main_id;
        if let Err(e) = store.insert_session(&mut session) {
            warn!("Failed to open session for device {}: {}", self.device, e);
            return None;
        }
        debug!("Opened session {:?} for device {}", session.id, self.device);
        let id = session.id;
        self.session = Some(session);
        self.opened = true;
        self.dirty = true;
        id
    }

    fn flush(&mut self, now_ms: i64, store: &dyn SampleStore) {
        match store.commit() {
            Ok(()) => {
                self.dirty = false;
                self.last_commit_ms = Some(now_ms);
            }
            Err(e) => warn!("Commit failed: {}", e),
        }
    }
}
