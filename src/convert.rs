/*!
 # Unit conversion between human values and the bulb's native scales

 Color temperature is exchanged with the bulb on a 0-1000 scale, where 0
 is the warmest (2700K) and 1000 the coolest (6500K) white. Brightness uses
 10-1000; the bulb does not accept 0.

 All conversions clamp first and use integer arithmetic, so a Kelvin value
 that goes to the device scale and back may come back a few Kelvin lower.
*/

/// Warmest supported color temperature
pub const MIN_KELVIN: u16 = 2700;
/// Coolest supported color temperature
pub const MAX_KELVIN: u16 = 6500;

/// Device scale for color temperature
pub const TEMP_DEVICE_MIN: u16 = 0;
pub const TEMP_DEVICE_MAX: u16 = 1000;

/// Device scale for brightness
pub const BRIGHTNESS_DEVICE_MIN: u16 = 10;
pub const BRIGHTNESS_DEVICE_MAX: u16 = 1000;

/// Neutral white used whenever a temperature cannot be read
pub const DEFAULT_KELVIN: u16 = 4700;
/// Mid-point brightness used whenever a brightness cannot be read
pub const DEFAULT_BRIGHTNESS: u16 = 500;

const KELVIN_SPAN: i64 = (MAX_KELVIN - MIN_KELVIN) as i64;
const TEMP_DEVICE_SPAN: i64 = (TEMP_DEVICE_MAX - TEMP_DEVICE_MIN) as i64;

/// Clamps a Kelvin value into the supported range.
pub fn clamp_kelvin(kelvin: i64) -> u16 {
    kelvin.clamp(MIN_KELVIN as i64, MAX_KELVIN as i64) as u16
}

/// Clamps a brightness value into the device range.
///
/// 0 and negative values floor to the minimum.
pub fn clamp_brightness(units: i64) -> u16 {
    units.clamp(BRIGHTNESS_DEVICE_MIN as i64, BRIGHTNESS_DEVICE_MAX as i64) as u16
}

/// Converts Kelvin to the device color temperature scale (0-1000).
pub fn kelvin_to_device(kelvin: i64) -> u16 {
    let kelvin = clamp_kelvin(kelvin) as i64;
    ((kelvin - MIN_KELVIN as i64) * TEMP_DEVICE_SPAN / KELVIN_SPAN) as u16
}

/// Converts the device color temperature scale (0-1000) to Kelvin.
pub fn device_to_kelvin(value: i64) -> u16 {
    let value = value.clamp(TEMP_DEVICE_MIN as i64, TEMP_DEVICE_MAX as i64);
    (MIN_KELVIN as i64 + value * KELVIN_SPAN / TEMP_DEVICE_SPAN) as u16
}

/// Converts a brightness percentage to device units.
pub fn percent_to_device(percent: i64) -> u16 {
    clamp_brightness(percent.saturating_mul(10))
}

/// Converts device brightness units to a percentage (1-100).
pub fn device_to_percent(units: i64) -> u8 {
    (clamp_brightness(units) / 10) as u8
}
