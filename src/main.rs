mod auth;
mod cancel;
mod cli;
mod config;
mod controller;
mod error;
mod export;
mod fetch;
mod gitlab;
mod joblog;
mod pool;
mod trace;
mod window;

use anyhow::Result;
use cancel::CancellationToken;
use clap::Parser;
use cli::Cli;
use log::{info, warn};

/// First Ctrl-C cancels the run, the second one exits right away.
fn handle_interrupts(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Unable to listen for Ctrl-C");
            return;
        }
        info!("Shutting down, press Ctrl-C again to exit immediately");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    env_logger::Builder::new()
        .parse_filters(&config.log.level)
        .parse_default_env()
        .init();

    info!("Starting cisync");
    let cancel = CancellationToken::new();
    handle_interrupts(cancel.clone());

    cli.execute(&config, cancel).await?;

    Ok(())
}
