use clap::Parser;
use color_eyre::Result;
use serial_bridge::{cli, logging, supervisor::Bridge};
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use tracing::{error, info};

#[cfg(unix)]
use tracing::warn;

#[cfg(unix)]
async fn hangup() {
    match signal(SignalKind::hangup()) {
        Ok(mut hangup) => {
            hangup.recv().await;
        }
        Err(e) => {
            warn!(%e, "Cannot listen for hangups");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn hangup() {
    std::future::pending::<()>().await
}

async fn run(cli: &cli::Cli) -> Result<()> {
    let config = cli.resolve_config()?;
    let bridge = Bridge::start(config).await?;

    let shutdown = CancellationToken::new();
    let mut running = tokio::spawn(bridge.run(shutdown.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        _ = hangup() => {
            info!("Told to hang up, quitting")
        }
        result = &mut running => {
            error!("Bridge returned");
            result??;
            return Err(color_eyre::eyre::eyre!("Bridge stopped unexpectedly"));
        }
    }

    shutdown.cancel();
    running.await??;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let Some(command) = cli.command.clone() {
        let config = cli.resolve_config()?;
        cli::handle_command(command, &config)?;

        return Ok(());
    }

    logging::init(logging::LogTargets {
        stdout: cli.log_level,
        file: cli.log_dir.clone().map(|dir| (cli.log_level, dir)),
    });

    let result = run(&cli).await;
    if let Err(e) = &result {
        error!(%e, "Bridge failed");
    }

    // Flushes the log file on every way out
    logging::shutdown();

    result
}
