//! Static configuration for the panel and the bulb.
//!
//! Everything here is read once at startup from a TOML file and never
//! changed afterwards:
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:5000"
//!
//! [bulb]
//! device_id = "bf91c81918a901700a0abp"
//! ip_address = "172.20.10.3"
//! local_key = "0123456789abcdef"
//! version = 3.3
//! ```

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::session::SessionOptions;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "bulb.toml";

/// TCP port Tuya devices listen on.
pub const TUYA_PORT: u16 = 6668;

/// Top level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// The bulb to control.
    pub bulb: BulbConfig,
    /// Link tuning.
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        content.parse()
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.bulb.validate());
        errors.extend(self.session.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind, host:port.
    pub bind: String,
    /// Directory with the browser front end, served at `/`.
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".to_string(),
            static_dir: None,
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.bind.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "server.bind",
                format!("'{}' is not a host:port address", self.bind),
            ));
        }
        errors
    }
}

/// Identity and secret of the bulb.
#[derive(Debug, Clone, Deserialize)]
pub struct BulbConfig {
    /// Tuya device id (gwId/devId).
    pub device_id: String,
    /// Address of the bulb on the local network.
    pub ip_address: String,
    /// Pre-shared local key.
    pub local_key: LocalKey,
    /// Protocol version, e.g. 3.3.
    pub version: ProtocolVersion,
}

impl BulbConfig {
    /// First eight characters of the device id, for display.
    pub fn redacted_device_id(&self) -> String {
        let prefix: String = self.device_id.chars().take(8).collect();
        format!("{prefix}...")
    }

    /// `ip:port` string for the given port.
    pub fn endpoint(&self, port: u16) -> String {
        match self.ip_address.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port).to_string(),
            Err(_) => format!("{}:{}", self.ip_address, port),
        }
    }

    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.device_id.trim().is_empty() {
            errors.push(ValidationError::new("bulb.device_id", "must not be empty"));
        }
        if self.ip_address.trim().is_empty() {
            errors.push(ValidationError::new("bulb.ip_address", "must not be empty"));
        }
        if self.local_key.as_bytes().len() != LocalKey::LEN {
            errors.push(ValidationError::new(
                "bulb.local_key",
                format!(
                    "must be exactly {} bytes, got {}",
                    LocalKey::LEN,
                    self.local_key.as_bytes().len()
                ),
            ));
        }
        if !self.version.is_supported() {
            errors.push(ValidationError::new(
                "bulb.version",
                format!("protocol {} is not supported (only 3.3)", self.version),
            ));
        }
        errors
    }
}

/// The local encryption key. Never printed.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct LocalKey(String);

impl LocalKey {
    /// AES-128 key length.
    pub const LEN: usize = 16;

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LocalKey(***)")
    }
}

/// Tuya protocol version.
///
/// Accepts both `version = 3.3` and `version = "3.3"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "VersionRepr")]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const V3_3: ProtocolVersion = ProtocolVersion { major: 3, minor: 3 };

    pub fn is_supported(&self) -> bool {
        *self == Self::V3_3
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| format!("'{s}' is not a major.minor version"))?;
        let parse = |part: &str| {
            part.parse::<u8>()
                .map_err(|_| format!("'{s}' is not a major.minor version"))
        };
        Ok(Self {
            major: parse(major)?,
            minor: parse(minor)?,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VersionRepr {
    Number(f64),
    Text(String),
}

impl TryFrom<VersionRepr> for ProtocolVersion {
    type Error = String;

    fn try_from(repr: VersionRepr) -> Result<Self, Self::Error> {
        match repr {
            VersionRepr::Number(n) if n.is_finite() && n > 0.0 && n < 26.0 => {
                let tenths = (n * 10.0).round() as u16;
                Ok(Self {
                    major: (tenths / 10) as u8,
                    minor: (tenths % 10) as u8,
                })
            }
            VersionRepr::Number(n) => Err(format!("{n} is not a protocol version")),
            VersionRepr::Text(s) => s.parse(),
        }
    }
}

/// Link tuning. The defaults match what the bulb tolerates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds to wait for each reply.
    pub timeout_secs: u64,
    /// Re-sends after a timed out request.
    pub retry_limit: u8,
    /// Device TCP port.
    pub port: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            retry_limit: 1,
            port: TUYA_PORT,
        }
    }
}

impl SessionConfig {
    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            timeout: Duration::from_secs(self.timeout_secs),
            retry_limit: self.retry_limit,
            port: self.port,
        }
    }

    fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.timeout_secs == 0 {
            errors.push(ValidationError::new(
                "session.timeout_secs",
                "must be at least 1",
            ));
        }
        if self.port == 0 {
            errors.push(ValidationError::new("session.port", "must not be 0"));
        }
        errors
    }
}

/// One invalid field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<ConfigError> for crate::Error {
    fn from(e: ConfigError) -> Self {
        crate::Error::InvalidConfig(e.to_string())
    }
}
