/*!
 # Bulb state translation

 Turns the raw data-point map returned by a status query into a
 [`BulbState`]. Translation never fails: missing or unusable fields are
 replaced with fixed defaults.
*/

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::convert::{
    clamp_brightness, clamp_kelvin, device_to_kelvin, device_to_percent, DEFAULT_BRIGHTNESS,
    DEFAULT_KELVIN, TEMP_DEVICE_MAX,
};

/// Raw data points as reported by the bulb, keyed by data-point id
pub type Dps = serde_json::Map<String, Value>;

/// Data-point ids used by white-light Tuya bulbs
pub mod dp {
    /// Power switch (bool)
    pub const POWER: &str = "20";
    /// Work mode ("white", "colour", "scene", "music")
    pub const MODE: &str = "21";
    /// Brightness (10-1000)
    pub const BRIGHTNESS: &str = "22";
    /// Color temperature (0-1000)
    pub const TEMPERATURE: &str = "23";

    /// Work mode value for plain white light
    pub const MODE_WHITE: &str = "white";
}

/// Normalized bulb state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BulbState {
    /// Whether the bulb is on
    pub power: bool,
    /// Brightness in device units (10-1000)
    pub brightness: u16,
    /// Color temperature in Kelvin (2700-6500)
    pub temperature: u16,
}

impl BulbState {
    /// Brightness as a percentage (1-100)
    pub fn brightness_percent(&self) -> u8 {
        device_to_percent(self.brightness as i64)
    }
}

impl Default for BulbState {
    fn default() -> Self {
        Self {
            power: true,
            brightness: DEFAULT_BRIGHTNESS,
            temperature: DEFAULT_KELVIN,
        }
    }
}

/// Translates a raw data-point map into a [`BulbState`].
pub fn translate(dps: &Dps) -> BulbState {
    BulbState {
        power: dps.get(dp::POWER).map_or(true, truthy),
        brightness: dps
            .get(dp::BRIGHTNESS)
            .and_then(brightness_units)
            .unwrap_or_else(|| {
                debug!("Brightness missing or unusable, defaulting to {DEFAULT_BRIGHTNESS}");
                DEFAULT_BRIGHTNESS
            }),
        temperature: dps
            .get(dp::TEMPERATURE)
            .and_then(temperature_kelvin)
            .unwrap_or_else(|| {
                debug!("Temperature missing or unusable, defaulting to {DEFAULT_KELVIN}K");
                DEFAULT_KELVIN
            }),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
}

// Zero reads as "no value".
fn brightness_units(value: &Value) -> Option<u16> {
    let units = match value {
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        other => as_integer(other)?,
    };
    (units != 0).then(|| clamp_brightness(units))
}

// Firmware differs: some report the 0-1000 scale, some report Kelvin.
fn temperature_kelvin(value: &Value) -> Option<u16> {
    let raw = as_integer(value)?;
    if raw <= TEMP_DEVICE_MAX as i64 {
        Some(device_to_kelvin(raw))
    } else {
        Some(clamp_kelvin(raw))
    }
}
