// JSON bodies sent to the bulb. Sample exchanges with a white-light
// bulb (after decryption):
//
//  Query the data points:
//
//   Sent:      {"gwId":"bf91...","devId":"bf91...","uid":"bf91...","t":"1700000000"}
//   Received:  {"devId":"bf91...","dps":{"20":true,"21":"white","22":1000,"23":500}}
//
//  Turning it off:
//
//   Sent:      {"devId":"bf91...","uid":"bf91...","t":"1700000000","dps":{"20":false}}
//   Received:  (empty acknowledgement, then a status push with the new dps)
//
//  Bad query on a "device22" bulb:
//
//   Received:  json obj data unvalid

use serde_json::{json, Map, Value};

use crate::state::{dp, Dps};

// Data points requested from bulbs that need an explicit list.

const KNOWN_DPS: [&str; 4] = [dp::POWER, dp::MODE, dp::BRIGHTNESS, dp::TEMPERATURE];

pub fn timestamp() -> String {
    chrono::Utc::now().timestamp().to_string()
}

pub fn query(device_id: &str, t: &str) -> Value {
    json!({
        "gwId": device_id,
        "devId": device_id,
        "uid": device_id,
        "t": t,
    })
}

pub fn query_device22(device_id: &str, t: &str) -> Value {
    let dps: Map<String, Value> = KNOWN_DPS
        .iter()
        .map(|k| (k.to_string(), Value::Null))
        .collect();

    json!({
        "devId": device_id,
        "uid": device_id,
        "t": t,
        "dps": dps,
    })
}

pub fn control(device_id: &str, dps: &Dps, t: &str) -> Value {
    json!({
        "devId": device_id,
        "uid": device_id,
        "t": t,
        "dps": dps,
    })
}

// Pulls the data-point map out of a decoded reply.

pub fn dps_of(reply: &Value) -> Option<Dps> {
    reply.get("dps")?.as_object().cloned()
}
