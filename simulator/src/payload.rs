use chrono::{NaiveDateTime, Utc};
use rand::Rng;
use serde::Serialize;

const HEALTH_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Body published on `devices/{device_id}/data`.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryPayload {
    pub value1: f64,
    pub value2: f64,
    pub value3: f64,
    pub data_timestamp: String,
    /// Not accepted by the monitor; sent so the field filter has something to drop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
}

/// Body published on the shared health topic.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    pub device_id: String,
    pub status: String,
    pub health_timestamp: String,
    pub battery_percentage: f64,
}

pub fn health_timestamp(now: NaiveDateTime) -> String {
    now.format(HEALTH_TIMESTAMP_FORMAT).to_string()
}

pub fn generate_telemetry(rng: &mut impl Rng) -> TelemetryPayload {
    let value1 = if rng.gen_bool(0.05) {
        rng.gen_range(-50.0..100.0) // 5% outliers
    } else {
        rng.gen_range(15.0..35.0)
    };

    TelemetryPayload {
        value1,
        value2: rng.gen_range(30.0..80.0),
        value3: rng.gen_range(0.0..1000.0),
        data_timestamp: Utc::now().to_rfc3339(),
        firmware: rng.gen_bool(0.1).then(|| "1.4.2".to_string()),
    }
}

pub fn generate_heartbeat(rng: &mut impl Rng, device_id: &str) -> HeartbeatPayload {
    let battery_percentage = if rng.gen_bool(0.02) {
        rng.gen_range(0.0..20.0) // 2% low battery
    } else {
        rng.gen_range(20.0..100.0)
    };

    HeartbeatPayload {
        device_id: device_id.to_string(),
        status: "connected".to_string(),
        health_timestamp: health_timestamp(Utc::now().naive_utc()),
        battery_percentage,
    }
}
