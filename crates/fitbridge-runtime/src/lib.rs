//! Fitbridge Runtime
//!
//! The backend side of fitbridge:
//! - device kinds (heart-rate sensors, Keiser M3i bikes) and their byte parsers
//! - [`DeviceManager`]: per-device connect/search/disconnect state machine
//! - [`FleetCoordinator`]: ordered connects with retry and backoff
//! - [`FitService`]: the single loop tying managers, driver, database and OSC
//!   commands together
//! - [`ControlClient`]: typed frontend calls against a running service

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod client;
pub mod connectors;
pub mod devices;
pub mod error;
pub mod fleet;
pub mod manager;
pub mod notification;
pub mod service;
pub mod undo;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use client::{toast, toast_for, ControlClient, DeviceListing};
pub use connectors::{ConnectorConfig, ConnectorHub, PlaceholderRenderer, TemplateRenderer};
pub use devices::{ConnectStrategy, DeviceInfo, DeviceKind, HeartRateKind, KeiserKind, KindRegistry};
pub use error::{Result, ServiceError};
pub use fleet::{FleetCoordinator, FleetEffect, ManagerPool, Operation, OperationInfo};
pub use manager::{DeviceManager, ManagerContext, ManagerEffect, TimerKind};
pub use notification::{NotificationSink, TracingNotifications};
pub use service::{FitService, LogControl, ServiceHandle};
pub use undo::UndoChain;
