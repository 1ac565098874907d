/*!
 # Tuya Smart Bulb Control Panel Library

 A Rust library for controlling a single Wi-Fi light bulb that speaks the
 Tuya local-network protocol (version 3.3), plus the pieces used by the
 `bulbd` web panel and the `bulbctl` command-line tool.

 ## Features

 * Persistent device session with bounded timeouts and explicit reconnect
 * Power on/off control
 * Brightness adjustment (device scale 10-1000)
 * Color temperature control (2700K-6500K)
 * State translation from raw data points
 * Local network discovery (ARP lookup and port scan)

 ## Example

 ```no_run
 use tuya_bulb_panel::*;

 #[tokio::main]
 async fn main() -> Result<()> {
     // Initialize tracing for logs
     tracing_subscriber::fmt::init();

     let config = Config::load("bulb.toml")?;
     let session = DeviceSession::tcp(config.bulb.clone(), config.session.options());

     // Open the persistent link once
     session.connect().await?;

     // Basic operations
     session.set_power(true).await?;
     session.set_brightness(800).await?;
     session.set_color_temperature(kelvin_to_device(4000)).await?;

     let state = session.state().await?;
     println!("{state:?}");

     Ok(())
 }
 ```
*/

use std::time::Duration;

use thiserror::Error;

/// Custom error types for the bulb control library
#[derive(Error, Debug)]
pub enum Error {
    /// No live link to the bulb
    #[error("Bulb not connected")]
    NotConnected,

    /// Opening the socket to the bulb failed
    #[error("Could not connect to bulb at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The bulb did not answer in time
    #[error("Bulb did not respond within {0:?}")]
    Timeout(Duration),

    /// The bulb answered with something we could not use
    #[error("Malformed response from bulb: {0}")]
    MalformedResponse(String),

    /// The byte stream no longer lines up with frame boundaries
    #[error("Lost framing on the link to the bulb: {0}")]
    Desync(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket level failure on an established link
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true when the error means the socket itself is gone, or can
    /// no longer be read frame by frame, and the handle should be discarded.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, Error::Io(_) | Error::NotConnected | Error::Desync(_))
    }
}

// Import needed for Result type extension
pub type Result<T> = std::result::Result<T, Error>;

pub mod api;
pub mod config;
pub mod convert;
pub mod discovery;
pub mod mock;
pub mod session;
pub mod state;
pub mod tuya;

// Re-export key types
pub use config::{BulbConfig, Config, ConfigError, LocalKey, ProtocolVersion, SessionConfig};
pub use convert::{
    clamp_brightness, clamp_kelvin, device_to_kelvin, device_to_percent, kelvin_to_device,
    percent_to_device,
};
pub use session::{Connector, DeviceLink, DeviceSession, LinkStatus, SessionOptions};
pub use state::{translate, BulbState, Dps};
pub use tuya::{TcpConnector, TuyaLink};
