//! Per-device derivators
//!
//! A derivator turns a stream of raw samples into session-anchored metrics
//! with pause detection. [`DeviceSimulator`] pairs one with a
//! [`SessionRecorder`] that persists what it produces.

mod heart_rate;
mod keiser;
mod recorder;

pub use heart_rate::HeartRateDerivator;
pub use keiser::{keiser_distance_km, KeiserDerivator};
pub use recorder::{SampleStore, SessionRecorder};

use crate::model::{Sample, Session};
use crate::state::DeviceState;

// ----------------------------------------------------------------------------
// Step Result
// ----------------------------------------------------------------------------

/// Outcome of one derivator step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// Active sample inside a span
    Online,
    /// Inactive sample after at least one active one
    DPause,
    /// Nothing active seen yet
    InvalidStep,
}

impl StepState {
    /// Visible manager state for this outcome
    pub fn device_state(self) -> DeviceState {
        match self {
            StepState::Online => DeviceState::Online,
            StepState::DPause => DeviceState::DPause,
            StepState::InvalidStep => DeviceState::InvalidStep,
        }
    }
}

// ----------------------------------------------------------------------------
// Derivator Trait
// ----------------------------------------------------------------------------

/// Stateful stream processor for one device
pub trait Derivator: Send {
    /// Augment `sample` with derived fields and classify it
    ///
    /// Samples of another device kind are classified as invalid and left
    /// untouched.
    fn step(&mut self, sample: &mut Sample, now_ms: i64) -> StepState;
}

// ----------------------------------------------------------------------------
// Device Simulator
// ----------------------------------------------------------------------------

/// A derivator bound to the session it records into
pub struct DeviceSimulator {
    derivator: Box<dyn Derivator>,
    recorder: SessionRecorder,
}

impl DeviceSimulator {
    pub fn new(derivator: Box<dyn Derivator>, recorder: SessionRecorder) -> Self {
        Self {
            derivator,
            recorder,
        }
    }

    /// Derive one sample and persist it
    ///
    /// Stamps the sample with `now_ms`. Invalid steps are not recorded.
    pub fn step(&mut self, sample: &mut Sample, now_ms: i64, store: &dyn SampleStore) -> StepState {
        sample.set_timestamp(now_ms);
        let state = self.derivator.step(sample, now_ms);
        if state != StepState::InvalidStep {
            self.recorder.record(sample, state, now_ms, store);
        }
        state
    }

    /// Chain this simulator's session to the fleet's main session
    pub fn set_main_session(&mut self, main_id: Option<i64>) {
        self.recorder.set_main_session(main_id);
    }

    /// Session opened so far, if any
    pub fn session(&self) -> Option<&Session> {
        self.recorder.session()
    }

    /// Take the session opened by the latest step, once
    pub fn take_opened_session(&mut self) -> Option<Session> {
        self.recorder.take_opened()
    }

    /// Flush pending writes at the end of a connection
    pub fn finish(&mut self, store: &dyn SampleStore) {
        self.recorder.finish(store);
    }
}
