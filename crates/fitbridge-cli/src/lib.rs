//! fitbridge CLI library
//!
//! Entry points for the backend service, the split BLE driver endpoint and
//! the control client, plus configuration loading and logging setup.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;

pub use cli::{Cli, Commands, CtlCommand};
pub use commands::CommandDispatcher;
pub use error::{CliError, Result};
pub use logging::LogHandle;
