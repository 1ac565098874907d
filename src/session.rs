/*!
 # Device session

 [`DeviceSession`] owns the one persistent link to the bulb. It is built
 once at startup, shared behind an `Arc`, and serializes every operation
 through an async mutex around the link.

 The session never reconnects on its own. When the link dies, every
 operation fails with [`Error::NotConnected`] until [`DeviceSession::reconnect`]
 is called.
*/

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{BulbConfig, TUYA_PORT};
use crate::convert::{clamp_brightness, TEMP_DEVICE_MAX};
use crate::state::{dp, translate, BulbState, Dps};
use crate::tuya::TcpConnector;
use crate::{Error, Result};

/// Timeout and retry budget of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Deadline for connecting and for each reply
    pub timeout: Duration,
    /// Re-sends after a timed out request
    pub retry_limit: u8,
    /// Device TCP port
    pub port: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry_limit: 1,
            port: TUYA_PORT,
        }
    }
}

/// An open connection to a bulb
#[async_trait]
pub trait DeviceLink: Send {
    /// Reads the raw data points.
    async fn status(&mut self) -> Result<Dps>;

    /// Writes one or more data points in a single request.
    async fn set_dps(&mut self, dps: Dps) -> Result<()>;
}

/// Something that can open a [`DeviceLink`]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Link: DeviceLink + 'static;

    async fn connect(&self, config: &BulbConfig, options: &SessionOptions) -> Result<Self::Link>;
}

/// What the outside world may know about the link
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    /// A link is held
    pub established: bool,
    /// The last operation on it succeeded
    pub responsive: bool,
    /// Message of the last failure, if any
    pub last_error: Option<String>,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        self.established && self.responsive
    }
}

/// The single session with the bulb
pub struct DeviceSession<C: Connector = TcpConnector> {
    config: BulbConfig,
    options: SessionOptions,
    connector: C,
    link: Mutex<Option<C::Link>>,
    status: RwLock<LinkStatus>,
}

impl DeviceSession<TcpConnector> {
    /// Creates a session that talks to the bulb over TCP. Nothing is
    /// opened until [`DeviceSession::connect`].
    pub fn tcp(config: BulbConfig, options: SessionOptions) -> Self {
        Self::new(config, options, TcpConnector)
    }
}

impl<C: Connector> DeviceSession<C> {
    pub fn new(config: BulbConfig, options: SessionOptions, connector: C) -> Self {
        Self {
            config,
            options,
            connector,
            link: Mutex::new(None),
            status: RwLock::new(LinkStatus::default()),
        }
    }

    pub fn config(&self) -> &BulbConfig {
        &self.config
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Snapshot of the link status. Does not touch the device.
    pub fn status(&self) -> LinkStatus {
        self.status.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.read().is_connected()
    }

    /// Opens the link and checks that the bulb answers a status query.
    /// Any link already held is replaced.
    #[instrument(skip(self), fields(addr = %self.config.endpoint(self.options.port)))]
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.link.lock().await;
        self.open_into(&mut slot).await
    }

    /// Drops the current link, if any, and connects again. Failures are
    /// returned as-is; no further attempt is made.
    #[instrument(skip(self), fields(addr = %self.config.endpoint(self.options.port)))]
    pub async fn reconnect(&self) -> Result<()> {
        let mut slot = self.link.lock().await;

        if slot.take().is_some() {
            debug!("Dropped previous link");
        }
        info!("Manual reconnection requested");
        self.open_into(&mut slot).await
    }

    async fn open_into(&self, slot: &mut Option<C::Link>) -> Result<()> {
        *slot = None;
        {
            let mut status = self.status.write();
            status.established = false;
            status.responsive = false;
        }

        info!("Connecting to bulb");

        let mut link = match self.connector.connect(&self.config, &self.options).await {
            Ok(link) => link,
            Err(e) => {
                error!("Could not connect to bulb: {}", e);
                self.status.write().last_error = Some(e.to_string());
                return Err(e);
            }
        };

        debug!("Testing connection");

        match link.status().await {
            Ok(dps) => {
                info!("Bulb connected and responding");
                debug!("Available data points: {:?}", dps.keys().collect::<Vec<_>>());
                *slot = Some(link);
                *self.status.write() = LinkStatus {
                    established: true,
                    responsive: true,
                    last_error: None,
                };
                Ok(())
            }
            Err(e) => {
                error!("Bulb did not answer the status probe: {}", e);
                self.status.write().last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    // Runs one operation on the held link. Link faults drop the link;
    // other failures keep it but mark it unresponsive.

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut C::Link) -> BoxFuture<'a, Result<T>>,
    {
        let mut slot = self.link.lock().await;

        let Some(link) = slot.as_mut() else {
            warn!("No link to the bulb");
            return Err(Error::NotConnected);
        };

        match op(link).await {
            Ok(value) => {
                let mut status = self.status.write();
                status.responsive = true;
                status.last_error = None;
                Ok(value)
            }
            Err(e) => {
                let mut status = self.status.write();

                if e.is_link_fault() {
                    warn!("Link to bulb lost: {}", e);
                    *slot = None;
                    status.established = false;
                } else {
                    warn!("Bulb operation failed: {}", e);
                }
                status.responsive = false;
                status.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Reads the raw data points.
    #[instrument(skip(self))]
    pub async fn query_state(&self) -> Result<Dps> {
        let dps = self.run(|link| link.status()).await?;
        debug!("Received dps: {:?}", dps);
        Ok(dps)
    }

    /// Reads and translates the bulb state.
    #[instrument(skip(self))]
    pub async fn state(&self) -> Result<BulbState> {
        let state = translate(&self.query_state().await?);
        debug!(
            "Parsed state - power: {}, brightness: {}, temperature: {}K",
            state.power, state.brightness, state.temperature
        );
        Ok(state)
    }

    /// Turns the bulb on or off.
    #[instrument(skip(self))]
    pub async fn set_power(&self, on: bool) -> Result<()> {
        self.write(dps([(dp::POWER, Value::Bool(on))])).await?;
        info!("Bulb turned {}", if on { "ON" } else { "OFF" });
        Ok(())
    }

    /// Sets the brightness in device units, clamped to 10-1000.
    #[instrument(skip(self))]
    pub async fn set_brightness(&self, units: u16) -> Result<()> {
        let units = clamp_brightness(units as i64);
        self.write(dps([(dp::BRIGHTNESS, Value::from(units))]))
            .await?;
        info!("Brightness set to {}", units);
        Ok(())
    }

    /// Sets the color temperature in device units, clamped to 0-1000.
    #[instrument(skip(self))]
    pub async fn set_color_temperature(&self, units: u16) -> Result<()> {
        let units = units.min(TEMP_DEVICE_MAX);
        self.write(dps([(dp::TEMPERATURE, Value::from(units))]))
            .await?;
        info!("Color temperature set to {} (device scale)", units);
        Ok(())
    }

    /// Turns the bulb on and applies brightness and temperature in one
    /// write, or just turns it off.
    #[instrument(skip(self))]
    pub async fn set_combined(&self, on: bool, brightness: u16, temperature: u16) -> Result<()> {
        if !on {
            return self.set_power(false).await;
        }

        self.set_power(true).await?;

        let brightness = clamp_brightness(brightness as i64);
        let temperature = temperature.min(TEMP_DEVICE_MAX);

        self.write(dps([
            (dp::MODE, Value::from(dp::MODE_WHITE)),
            (dp::BRIGHTNESS, Value::from(brightness)),
            (dp::TEMPERATURE, Value::from(temperature)),
        ]))
        .await?;
        info!(
            "White light set: brightness {}, temperature {} (device scale)",
            brightness, temperature
        );
        Ok(())
    }

    async fn write(&self, dps: Dps) -> Result<()> {
        self.run(move |link| link.set_dps(dps)).await
    }
}

fn dps<const N: usize>(entries: [(&str, Value); N]) -> Dps {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
