//! HTTP endpoints of the control panel.
//!
//! Every handler is a thin wrapper around one [`DeviceSession`] operation.
//! Device failures come back as `{"success": false, "error": "..."}` with
//! a non-2xx status; `/status`, `/connection`, `/restart` and `/debug`
//! always answer 200.
//!
//! # Endpoints
//!
//! - `GET /get-state` - current power, brightness and temperature
//! - `GET /status` - whether the bulb answers a status query
//! - `POST /power` - `{"state": bool}`
//! - `POST /brightness` - `{"brightness": 10-1000}`
//! - `POST /temperature` - `{"temperature": 2700-6500}`
//! - `POST /set-all` - `{"power": bool, "brightness": .., "temperature": ..}`
//! - `GET /connection` - link flag, address and partial device id
//! - `POST /restart` - drop the link and connect again
//! - `GET /debug` - configuration echo and converter samples

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::convert::{
    clamp_brightness, clamp_kelvin, kelvin_to_device, DEFAULT_BRIGHTNESS, DEFAULT_KELVIN,
    MAX_KELVIN, MIN_KELVIN,
};
use crate::session::{Connector, DeviceSession};
use crate::Error;

/// Shared state of the HTTP server.
pub struct AppState<C: Connector> {
    pub session: DeviceSession<C>,
    pub started_at: DateTime<Utc>,
}

impl<C: Connector> AppState<C> {
    pub fn new(session: DeviceSession<C>) -> Arc<Self> {
        Arc::new(Self {
            session,
            started_at: Utc::now(),
        })
    }
}

/// Create the API router.
pub fn router<C: Connector>() -> Router<Arc<AppState<C>>> {
    Router::new()
        .route("/get-state", get(get_state::<C>))
        .route("/status", get(get_status::<C>))
        .route("/power", post(set_power::<C>))
        .route("/brightness", post(set_brightness::<C>))
        .route("/temperature", post(set_temperature::<C>))
        .route("/set-all", post(set_all::<C>))
        .route("/connection", get(get_connection::<C>))
        .route("/restart", post(restart::<C>))
        .route("/debug", get(debug_info::<C>))
}

fn default_true() -> bool {
    true
}

fn default_brightness() -> f64 {
    DEFAULT_BRIGHTNESS.into()
}

fn default_kelvin() -> f64 {
    DEFAULT_KELVIN.into()
}

// Sliders may send `550.0`; the fraction is dropped.

fn truncate(value: f64) -> i64 {
    value.trunc() as i64
}

#[derive(Debug, Deserialize)]
pub struct PowerRequest {
    #[serde(default = "default_true")]
    pub state: bool,
}

#[derive(Debug, Deserialize)]
pub struct BrightnessRequest {
    /// Device units, clamped to 10-1000
    #[serde(default = "default_brightness")]
    pub brightness: f64,
}

#[derive(Debug, Deserialize)]
pub struct TemperatureRequest {
    /// Kelvin, clamped to 2700-6500
    #[serde(default = "default_kelvin")]
    pub temperature: f64,
}

#[derive(Debug, Deserialize)]
pub struct SetAllRequest {
    #[serde(default = "default_true")]
    pub power: bool,
    #[serde(default = "default_brightness")]
    pub brightness: f64,
    #[serde(default = "default_kelvin")]
    pub temperature: f64,
}

/// Current bulb state.
async fn get_state<C: Connector>(
    State(state): State<Arc<AppState<C>>>,
) -> Result<Json<Value>, ApiError> {
    let bulb = state.session.state().await?;

    Ok(Json(json!({
        "success": true,
        "state": bulb,
    })))
}

/// Reachability check. Never fails at the HTTP level.
async fn get_status<C: Connector>(State(state): State<Arc<AppState<C>>>) -> Json<Value> {
    let (connected, message) = match state.session.query_state().await {
        Ok(_) => (true, "Bulb is connected and responsive".to_string()),
        Err(Error::NotConnected) => (false, "Bulb not connected".to_string()),
        Err(Error::MalformedResponse(_)) => (false, "Bulb not responding".to_string()),
        Err(e) => {
            error!("Error checking status: {}", e);
            (false, format!("Error: {e}"))
        }
    };

    Json(json!({
        "connected": connected,
        "message": message,
    }))
}

async fn set_power<C: Connector>(
    State(state): State<Arc<AppState<C>>>,
    payload: Result<Json<PowerRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload?;

    state.session.set_power(req.state).await?;

    Ok(Json(json!({
        "success": true,
        "state": req.state,
    })))
}

async fn set_brightness<C: Connector>(
    State(state): State<Arc<AppState<C>>>,
    payload: Result<Json<BrightnessRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload?;
    let brightness = clamp_brightness(truncate(req.brightness));

    state.session.set_brightness(brightness).await?;

    Ok(Json(json!({
        "success": true,
        "brightness": brightness,
    })))
}

async fn set_temperature<C: Connector>(
    State(state): State<Arc<AppState<C>>>,
    payload: Result<Json<TemperatureRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload?;
    let kelvin = clamp_kelvin(truncate(req.temperature));
    let tuya_value = kelvin_to_device(kelvin as i64);

    state.session.set_color_temperature(tuya_value).await?;
    info!("Temperature: {}K (Tuya: {})", kelvin, tuya_value);

    Ok(Json(json!({
        "success": true,
        "temperature": kelvin,
        "tuya_value": tuya_value,
    })))
}

async fn set_all<C: Connector>(
    State(state): State<Arc<AppState<C>>>,
    payload: Result<Json<SetAllRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload?;
    let brightness = clamp_brightness(truncate(req.brightness));
    let kelvin = clamp_kelvin(truncate(req.temperature));
    let tuya_value = kelvin_to_device(kelvin as i64);

    state
        .session
        .set_combined(req.power, brightness, tuya_value)
        .await?;

    Ok(Json(json!({
        "success": true,
        "power": req.power,
        "brightness": brightness,
        "temperature": kelvin,
        "tuya_value": tuya_value,
    })))
}

/// Link flag for the front end. Does not touch the device.
async fn get_connection<C: Connector>(State(state): State<Arc<AppState<C>>>) -> Json<Value> {
    let config = state.session.config();

    Json(json!({
        "connected": state.session.is_connected(),
        "ip_address": config.ip_address,
        "device_id": config.redacted_device_id(),
    }))
}

/// Manual reconnection. Failures are reported in the body.
async fn restart<C: Connector>(State(state): State<Arc<AppState<C>>>) -> Json<Value> {
    match state.session.reconnect().await {
        Ok(()) => {
            info!("Reconnected successfully");
            Json(json!({"success": true, "message": "Reconnected"}))
        }
        Err(e) => {
            error!("Reconnection failed: {}", e);
            Json(json!({"success": false, "message": e.to_string()}))
        }
    }
}

/// Internal state without touching the device.
async fn debug_info<C: Connector>(State(state): State<Arc<AppState<C>>>) -> Json<Value> {
    let session = &state.session;
    let status = session.status();
    let options = session.options();

    Json(json!({
        "connection": {
            "established": status.established,
            "responsive": status.responsive,
            "bulb_exists": status.established,
            "last_error": status.last_error,
            "config_ip": session.config().ip_address,
            "protocol_version": session.config().version.to_string(),
            "started_at": state.started_at.to_rfc3339(),
        },
        "session": {
            "timeout_secs": options.timeout.as_secs_f64(),
            "retry_limit": options.retry_limit,
            "port": options.port,
        },
        "temperature": {
            "min_kelvin": MIN_KELVIN,
            "max_kelvin": MAX_KELVIN,
            "example_2700k_to_tuya": kelvin_to_device(2700),
            "example_6500k_to_tuya": kelvin_to_device(6500),
        },
    }))
}

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Device(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Device(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Device(e) => {
                error!("Bulb operation failed: {}", e);
                // Anything the bulb or the link did wrong is a 503.
                let status = match e {
                    Error::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    _ => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, e.to_string())
            }
        };

        let body = json!({
            "success": false,
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}
