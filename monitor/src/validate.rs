//! Decoding of raw broker messages into typed device messages.
//!
//! Every inbound publish goes through [`decode`] exactly once; the rest of the
//! pipeline only ever sees [`DeviceMessage`].

use crate::errors::Error;
use crate::model::{HeartbeatMessage, TelemetryMessage, TelemetryUpdate};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Telemetry(TelemetryMessage),
    Heartbeat(HeartbeatMessage),
    Invalid { reason: String },
}

impl DeviceMessage {
    fn invalid(reason: impl Into<String>) -> Self {
        DeviceMessage::Invalid {
            reason: reason.into(),
        }
    }

    /// Converts the `Invalid` case into a validation error.
    pub fn into_result(self) -> Result<DeviceMessage, Error> {
        match self {
            DeviceMessage::Invalid { reason } => Err(Error::Validation(reason)),
            other => Ok(other),
        }
    }
}

/// Topic layout the monitor listens on.
#[derive(Debug, Clone)]
pub struct Topics {
    /// Subscription filter for telemetry, e.g. `devices/+/data`.
    pub telemetry: String,
    /// Shared health topic, e.g. `device/health`.
    pub health: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            telemetry: "devices/+/data".to_string(),
            health: "device/health".to_string(),
        }
    }
}

impl Topics {
    /// Extracts the device id from a telemetry topic by matching it against
    /// the single-level wildcard in the subscription filter.
    pub fn telemetry_device_id<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let filter: Vec<&str> = self.telemetry.split('/').collect();
        let parts: Vec<&str> = topic.split('/').collect();
        if filter.len() != parts.len() {
            return None;
        }

        let mut device_id = None;
        for (f, p) in filter.iter().zip(parts.iter()) {
            match *f {
                "+" => {
                    if p.is_empty() || device_id.is_some() {
                        return None;
                    }
                    device_id = Some(*p);
                }
                literal if literal == *p => {}
                _ => return None,
            }
        }
        device_id
    }

    pub fn is_health(&self, topic: &str) -> bool {
        topic == self.health
    }
}

/// Decodes a publish into a typed message based on the topic it arrived on.
pub fn decode(topics: &Topics, topic: &str, payload: &[u8]) -> DeviceMessage {
    if topics.is_health(topic) {
        return decode_heartbeat(payload);
    }
    match topics.telemetry_device_id(topic) {
        Some(device_id) => decode_telemetry(device_id, payload),
        None => DeviceMessage::invalid(format!("Unrecognized topic {}", topic)),
    }
}

/// Decodes a telemetry payload. Unknown keys are dropped here; an empty
/// whitelist intersection still decodes and is rejected by the ingest path so
/// the device id can be reported.
pub fn decode_telemetry(device_id: &str, payload: &[u8]) -> DeviceMessage {
    let raw = match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return DeviceMessage::invalid("Telemetry payload is not a JSON object"),
        Err(e) => return DeviceMessage::invalid(format!("JSON parse error: {}", e)),
    };

    match telemetry_update(&raw) {
        Ok(update) => DeviceMessage::Telemetry(TelemetryMessage {
            device_id: device_id.to_string(),
            update,
        }),
        Err(reason) => DeviceMessage::invalid(reason),
    }
}

fn telemetry_update(raw: &Map<String, Value>) -> Result<TelemetryUpdate, String> {
    Ok(TelemetryUpdate {
        value1: number_field(raw, "value1")?,
        value2: number_field(raw, "value2")?,
        value3: number_field(raw, "value3")?,
        data_timestamp: text_field(raw, "data_timestamp"),
    })
}

/// `value1..3` land in numeric columns, so anything but a number or `null`
/// fails the payload.
fn number_field(raw: &Map<String, Value>, key: &str) -> Result<Option<Option<f64>>, String> {
    match raw.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(value) => value
            .as_f64()
            .map(|n| Some(Some(n)))
            .ok_or_else(|| format!("Telemetry field {} is not a number: {}", key, value)),
    }
}

/// Stored verbatim: strings as-is, any other JSON value in its text form.
fn text_field(raw: &Map<String, Value>, key: &str) -> Option<Option<String>> {
    match raw.get(key)? {
        Value::Null => Some(None),
        Value::String(s) => Some(Some(s.clone())),
        other => Some(Some(other.to_string())),
    }
}

pub fn decode_heartbeat(payload: &[u8]) -> DeviceMessage {
    // Checked on the raw value first so a missing id is reported as such
    // rather than as a generic schema error.
    let raw = match serde_json::from_slice::<Value>(payload) {
        Ok(raw) => raw,
        Err(e) => return DeviceMessage::invalid(format!("JSON parse error: {}", e)),
    };
    match raw.get("device_id").and_then(|v| v.as_str()) {
        Some(id) if !id.is_empty() => {}
        _ => return DeviceMessage::invalid("Heartbeat does not contain a device_id"),
    }

    match serde_json::from_value::<HeartbeatMessage>(raw) {
        Ok(heartbeat) => DeviceMessage::Heartbeat(heartbeat),
        Err(e) => DeviceMessage::invalid(format!("Heartbeat schema error: {}", e)),
    }
}
