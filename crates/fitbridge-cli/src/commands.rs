//! Command handlers for the fitbridge CLI

use std::sync::Arc;

use fitbridge_ble::{BleDriver, LocalBleDriver, RemoteBleClient, RemoteBleServer};
use fitbridge_core::{Database, FitConfig};
use fitbridge_osc::OscTransport;
use fitbridge_runtime::{toast_for, ControlClient, DeviceListing, FitService, ServiceError};
use tracing::{info, warn};

use crate::cli::{Cli, Commands, CtlCommand};
use crate::error::{CliError, Result};
use crate::logging::LogHandle;

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: FitConfig, log: LogHandle) -> Result<()> {
        match cli.command {
            Commands::Serve => Self::handle_serve(config, log).await,
            Commands::BleDriver => Self::handle_ble_driver(config).await,
            Commands::Ctl { command } => Self::handle_ctl(config, command).await,
        }
    }

    /// Run the backend until `/stop` or Ctrl+C
    async fn handle_serve(config: FitConfig, log: LogHandle) -> Result<()> {
        if let Some(parent) = config.database.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("Opening database {}", config.database.path.display());
        let db = Database::open(&config.database.path)?;
        let transport = OscTransport::start(&config.frontend).await?;

        let driver: Arc<dyn BleDriver> = match &config.driver {
            Some(hop) => {
                info!("Using remote BLE driver at {}", hop.peer);
                let hop = OscTransport::start(hop).await?;
                Arc::new(RemoteBleClient::new(hop)?)
            }
            None => Arc::new(LocalBleDriver::new().await?),
        };

        let mut service =
            FitService::new(config, db, transport, driver).with_log_control(Arc::new(log));
        service.start()?;

        let handle = service.handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping");
                handle.stop();
            }
        });

        service.run().await?;
        info!("Backend stopped");
        Ok(())
    }

    /// Serve BLE calls for a backend whose driver hop points here
    async fn handle_ble_driver(config: FitConfig) -> Result<()> {
        let hop = config.driver.as_ref().ok_or_else(|| {
            CliError::Config("no [driver] hop configured for the BLE driver endpoint".to_string())
        })?;
        let transport = OscTransport::start(&hop.mirrored()).await?;
        let driver: Arc<dyn BleDriver> = Arc::new(LocalBleDriver::new().await?);
        let server = RemoteBleServer::new(transport.clone(), driver);

        tokio::select! {
            result = server.run() => result?,
            _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping"),
        }
        transport.close().await;
        Ok(())
    }

    /// One control command against a running backend
    async fn handle_ctl(config: FitConfig, command: CtlCommand) -> Result<()> {
        let transport = OscTransport::start(&config.frontend.mirrored()).await?;
        let client = ControlClient::new(transport);
        let result = Self::run_ctl(&client, command).await;
        client.transport().close().await;
        result.map_err(|e| match e {
            e @ ServiceError::Rejected { .. } => CliError::Rejected(toast_for(&e)),
            other => CliError::Service(other),
        })
    }

    async fn run_ctl(client: &ControlClient, command: CtlCommand) -> fitbridge_runtime::Result<()> {
        match command {
            CtlCommand::Devices => {
                let devices = client.list_devices().await?;
                if devices.is_empty() {
                    println!("No devices");
                }
                for listing in &devices {
                    println!("{}", device_line(listing));
                }
            }
            CtlCommand::Users => {
                for user in client.list_users().await? {
                    println!("{:>4}  {}", user.id.unwrap_or_default(), user.name);
                }
            }
            CtlCommand::Views => {
                for view in client.list_views().await? {
                    let marker = if view.active { "*" } else { " " };
                    println!(
                        "{:>4} {} {} ({} devices)",
                        view.id.unwrap_or_default(),
                        marker,
                        view.name,
                        view.items.len()
                    );
                }
            }
            CtlCommand::Stop => {
                client.stop().await?;
                println!("Backend stopping");
            }
            CtlCommand::Loglevel { level } => {
                client.set_log_level(&level).await?;
                println!("Log level set to {level}");
            }
        }
        if !client.transport().is_peer_live() {
            warn!("Backend stopped answering pings");
        }
        Ok(())
    }
}

/// One row of `ctl devices`
pub fn device_line(listing: &DeviceListing) -> String {
    let battery = listing
        .info
        .battery
        .map(|b| format!(" {b}%"))
        .unwrap_or_default();
    format!(
        "{}  {:<12} {:<10} {:<18} {}{}",
        listing.uid,
        listing.device.alias,
        listing.device.kind,
        listing.device.address,
        listing.state,
        battery
    )
}
