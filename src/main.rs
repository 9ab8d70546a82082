mod args;
mod commands;

use anyhow::Context;
use args::{Cli, Commands};
use astoria::config::AstoriaConfig;
use astoria::{daemons, logging};
use clap::Parser;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    logging::init(cli.verbose)?;
    let config = AstoriaConfig::load(cli.config.as_deref())?;

    // Daemons and ctl commands share one single-threaded runtime.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Broker => commands::daemon::cmd_broker(&config).await,
            Commands::Astdiskd => daemons::astdiskd(&config).await,
            Commands::Astmetad => daemons::astmetad(&config).await,
            Commands::Astprocd => daemons::astprocd(&config).await,
            Commands::Astupdated => daemons::astupdated(&config).await,
            Commands::Ctl { command } => commands::ctl::cmd_ctl(command, &config).await,
        }
    })
}
