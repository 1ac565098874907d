use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use tracing::{debug, error, info, instrument};
use tracing_subscriber::EnvFilter;
use tuya_bulb_panel::config::{DEFAULT_CONFIG_PATH, TUYA_PORT};
use tuya_bulb_panel::discovery;
use tuya_bulb_panel::*;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file with the bulb credentials
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show power, brightness and color temperature
    Status,
    /// Turn the bulb on
    On,
    /// Turn the bulb off
    Off,
    /// Set brightness
    Brightness {
        /// Brightness level (1-100)
        #[arg(short, long, default_value_t = 100)]
        percent: u8,
    },
    /// Set color temperature
    ColorTemp {
        /// Color temperature in Kelvin (2700-6500)
        #[arg(short, long, default_value_t = 4000)]
        kelvin: u32,
    },
    /// Turn on with brightness and color temperature in one go
    White {
        /// Brightness level (1-100)
        #[arg(short, long, default_value_t = 100)]
        percent: u8,
        /// Color temperature in Kelvin (2700-6500)
        #[arg(short, long, default_value_t = 4700)]
        kelvin: u32,
    },
    /// Find the bulb on the local network
    Find {
        /// MAC address to look up in the ARP table
        #[arg(short, long)]
        mac: Option<String>,
        /// First three octets of the network to scan
        #[arg(long, default_value = "172.20.10")]
        subnet: String,
        /// First host to probe
        #[arg(long, default_value_t = 3)]
        start: u8,
        /// Last host to probe
        #[arg(long, default_value_t = 14)]
        end: u8,
        /// Addresses to leave out of the scan (this machine, usually)
        #[arg(long)]
        skip: Vec<Ipv4Addr>,
    },
}

#[tokio::main]
#[instrument]
async fn main() -> Result<()> {
    // Initialize tracing with pretty colors
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("tuya_bulb_panel=info")),
        )
        .compact()
        .init();

    // Initialize color-eyre for pretty error reporting
    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Find {
            mac,
            subnet,
            start,
            end,
            skip,
        } => find(mac.as_deref(), &subnet, start, end, &skip).await,
        command => control(&cli.config, command).await,
    }
}

async fn control(config_path: &Path, command: Commands) -> Result<()> {
    let config = Config::load_validated(config_path)?;
    let session = DeviceSession::tcp(config.bulb.clone(), config.session.options());

    if let Err(e) = session.connect().await {
        error!("Failed to connect to bulb: {}", e);
        return Err(e.into());
    }

    match command {
        Commands::Status => {
            let state = session.state().await?;

            println!("Power:       {}", if state.power { "on" } else { "off" });
            println!(
                "Brightness:  {} ({}%)",
                state.brightness,
                state.brightness_percent()
            );
            println!("Temperature: {}K", state.temperature);
        }
        Commands::On => {
            session.set_power(true).await?;
        }
        Commands::Off => {
            session.set_power(false).await?;
        }
        Commands::Brightness { percent } => {
            // Brightness changes are only visible while the bulb is on
            session.set_power(true).await?;
            session
                .set_brightness(percent_to_device(percent as i64))
                .await?;
        }
        Commands::ColorTemp { kelvin } => {
            session.set_power(true).await?;
            session
                .set_color_temperature(kelvin_to_device(kelvin as i64))
                .await?;
        }
        Commands::White { percent, kelvin } => {
            session
                .set_combined(
                    true,
                    percent_to_device(percent as i64),
                    kelvin_to_device(kelvin as i64),
                )
                .await?;
        }
        Commands::Find { .. } => {}
    }

    info!("Done");
    Ok(())
}

async fn find(mac: Option<&str>, subnet: &str, start: u8, end: u8, skip: &[Ipv4Addr]) -> Result<()> {
    let hosts = discovery::hosts(discovery::parse_subnet(subnet)?, start, end, skip);

    match discovery::find_bulb(mac, hosts, TUYA_PORT, discovery::PROBE_TIMEOUT).await {
        Some(ip) => {
            println!("{ip}");
            Ok(())
        }
        None => Err(eyre!("Bulb not found on network")),
    }
}
