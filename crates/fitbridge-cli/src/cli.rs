//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Database file, overriding the configuration
    #[arg(long, global = true)]
    pub db: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the backend service
    Serve,
    /// Run the BLE driver endpoint for a backend configured with a driver hop
    BleDriver,
    /// Drive a running backend
    Ctl {
        #[command(subcommand)]
        command: CtlCommand,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum CtlCommand {
    /// List devices with their manager uid and state
    Devices,
    /// List users
    Users,
    /// List views
    Views,
    /// Stop the backend
    Stop,
    /// Change the backend log level
    Loglevel {
        /// trace, debug, info, warn or error
        level: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ctl_with_global_flags() {
        let cli = Cli::try_parse_from(["fitbridge", "ctl", "loglevel", "debug", "-v"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Ctl { command } => assert_eq!(
                command,
                CtlCommand::Loglevel {
                    level: "debug".into()
                }
            ),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_serve_with_overrides() {
        let cli =
            Cli::try_parse_from(["fitbridge", "--db", "/tmp/fit.db", "serve", "-c", "fit.toml"])
                .unwrap();
        assert!(matches!(cli.command, Commands::Serve));
        assert_eq!(cli.db.as_deref(), Some("/tmp/fit.db"));
        assert_eq!(cli.config.as_deref(), Some("fit.toml"));
    }

    #[test]
    fn test_ble_driver_takes_no_arguments() {
        assert!(Cli::try_parse_from(["fitbridge", "ble-driver"]).is_ok());
        assert!(Cli::try_parse_from(["fitbridge", "ble-driver", "extra"]).is_err());
    }
}
