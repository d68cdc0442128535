//! fitbridge - BLE fitness device aggregation

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use fitbridge_cli::{cli::Cli, commands::CommandDispatcher, config, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log = logging::init(cli.verbose).context("installing the logger")?;

    let config = match config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = CommandDispatcher::execute(cli, config, log).await {
        error!("{}", e);
        std::process::exit(1);
    }

    info!("fitbridge exited successfully");
    Ok(())
}
