//! Fitbridge Core
//!
//! Foundational types for the fitbridge fitness-device aggregator: persisted
//! entities and their SQLite mapping, the tagged-string wire codec, the
//! per-device derivators that turn raw samples into session metrics, and the
//! label formatters consumed by external renderers.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod derivator;
pub mod errors;
pub mod formatter;
pub mod model;
pub mod state;
pub mod storage;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    DatabaseConfig, DerivatorConfig, FitConfig, FleetConfig, LivenessMode, OscConfig,
    TimeoutConfig,
};
pub use derivator::{
    DeviceSimulator, Derivator, HeartRateDerivator, KeiserDerivator, SampleStore,
    SessionRecorder, StepState,
};
pub use errors::{CodecError, EntityError, FitError, Result};
pub use formatter::{Formatter, FormatterKind, LabelFormatter};
pub use model::{
    Device, Entity, HrDeviceOutput, KeiserM3iOutput, Label, Sample, Session, User, View,
};
pub use state::{ConfirmCode, DeviceState, DisconnectReason};
pub use storage::{codec, Database, Record};
pub use types::{MockTimeSource, SystemTimeSource, TimeSource, Uid, UID_LEN};
