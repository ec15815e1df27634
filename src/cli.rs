use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, Level};

use crate::{
    actions::{Command, OutboundEnvelope},
    config::Config,
    detect,
    error::Error,
};

/// The command line interface for serial bridge.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Serial port of the device, e.g. /dev/ttyUSB0 or COM5. Auto-detected if not given
    #[arg(long, env = "SERIAL_BRIDGE_PORT")]
    pub port: Option<String>,

    /// Baud rate of the serial port
    #[arg(long, env = "SERIAL_BRIDGE_BAUD")]
    pub baud_rate: Option<u32>,

    /// Host the websocket server listens on
    #[arg(long, env = "SERIAL_BRIDGE_HOST")]
    pub host: Option<String>,

    /// Port the websocket server listens on
    #[arg(long, env = "SERIAL_BRIDGE_WS_PORT")]
    pub ws_port: Option<u16>,

    /// Use a loopback mock device instead of a serial port
    #[arg(long, conflicts_with = "port")]
    pub mock: bool,

    /// Log level of stdout
    #[arg(long, default_value_t = Level::INFO)]
    pub log_level: Level,

    /// Also log to daily rotated files in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List serial ports, and show which one would be auto-detected.
    Ports,

    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Debug, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example JSON command (from user to device).
    Command,

    /// Show an example JSON message (from device to user).
    Envelope,
}

impl Cli {
    /// The configuration file (or the default one), with command line arguments applied on top.
    pub fn resolve_config(&self) -> Result<Config, Error> {
        let mut config = if let Some(config_path) = &self.config {
            debug!(?config_path, "Config from path");
            Config::new_from_path(config_path)?
        } else {
            debug!("Default config");
            Config::default()
        };

        if let Some(port) = &self.port {
            config.port = Some(port.clone());
            config.mock = false;
        }

        if self.mock {
            config.port = None;
            config.mock = true;
        }

        if let Some(baud_rate) = self.baud_rate {
            config.baud_rate = baud_rate;
        }

        if let Some(host) = &self.host {
            config.host = host.clone();
        }

        if let Some(ws_port) = self.ws_port {
            config.ws_port = ws_port;
        }

        Ok(config)
    }
}

fn show_ports(config: &Config) -> Result<(), Error> {
    let ports = detect::available_ports()?;

    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    for info in &ports {
        println!("{:<20} {}", info.port_name, detect::describe(info));
    }

    match detect::select_port(&ports, &config.detect) {
        Some(port) => println!("\nAuto-detection picks: {port}"),
        None => println!("\nAuto-detection picks nothing"),
    }

    Ok(())
}

/// Run a subcommand.
pub fn handle_command(command: Commands, config: &Config) -> Result<(), Error> {
    match command {
        Commands::Ports => show_ports(config)?,
        Commands::Examples(example) => match example {
            Examples::Config => {
                println!("{}", Config::example().serialize_pretty()?);
            }
            Examples::Command => {
                println!("{}", Command::example_request());
            }
            Examples::Envelope => {
                let serialized = OutboundEnvelope::example()
                    .to_json()
                    .map_err(|e| Error::BadConfig(e.to_string()))?;
                println!("{serialized}");
            }
        },
    }

    Ok(())
}
