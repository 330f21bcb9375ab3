use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Format of `health_timestamp`, UTC without a zone suffix.
pub const HEALTH_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Telemetry fields a device is allowed to write.
pub const TELEMETRY_FIELDS: [&str; 4] = ["value1", "value2", "value3", "data_timestamp"];

/// Fields the value endpoint may return. Ownership and registration fields
/// are never served.
pub const READABLE_FIELDS: [&str; 7] = [
    "value1",
    "value2",
    "value3",
    "data_timestamp",
    "status",
    "health_timestamp",
    "battery_percentage",
];

/// Device document as stored. Field names are shared with the services that
/// register devices and serve values, so they must not be renamed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceRecord {
    pub device_id: String,
    pub user_id: Option<String>,
    pub status: Option<String>,
    pub value1: Option<f64>,
    pub value2: Option<f64>,
    pub value3: Option<f64>,
    pub data_timestamp: Option<String>,
    pub health_timestamp: Option<String>,
    pub battery_percentage: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: None,
            status: None,
            value1: None,
            value2: None,
            value3: None,
            data_timestamp: None,
            health_timestamp: None,
            battery_percentage: None,
            created_at: Some(Utc::now()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status.as_deref() == Some(DeviceStatus::Connected.as_str())
    }

    /// Looks up a readable field by its stored name, as the value endpoint
    /// does.
    pub fn field(&self, name: &str) -> Option<Value> {
        if !READABLE_FIELDS.contains(&name) {
            return None;
        }
        let json = serde_json::to_value(self).ok()?;
        json.get(name).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Connected,
    Disconnected,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Connected => "connected",
            DeviceStatus::Disconnected => "disconnected",
        }
    }
}

/// Whitelisted telemetry fields decoded from a payload. The outer `Option` is
/// key presence; a present key carrying JSON `null` is `Some(None)` and
/// clears the stored value. Keys outside the whitelist never make it into
/// this struct.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryUpdate {
    pub value1: Option<Option<f64>>,
    pub value2: Option<Option<f64>>,
    pub value3: Option<Option<f64>>,
    pub data_timestamp: Option<Option<String>>,
}

impl TelemetryUpdate {
    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Names of the fields this update will set.
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::with_capacity(TELEMETRY_FIELDS.len());
        if self.value1.is_some() {
            fields.push("value1");
        }
        if self.value2.is_some() {
            fields.push("value2");
        }
        if self.value3.is_some() {
            fields.push("value3");
        }
        if self.data_timestamp.is_some() {
            fields.push("data_timestamp");
        }
        fields
    }

    pub fn apply_to(&self, record: &mut DeviceRecord) {
        if let Some(v) = self.value1 {
            record.value1 = v;
        }
        if let Some(v) = self.value2 {
            record.value2 = v;
        }
        if let Some(v) = self.value3 {
            record.value3 = v;
        }
        if let Some(ts) = &self.data_timestamp {
            record.data_timestamp = ts.clone();
        }
    }
}

/// Telemetry addressed to one device through its topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub device_id: String,
    pub update: TelemetryUpdate,
}

/// Health report as published on the shared health topic.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HeartbeatMessage {
    pub device_id: String,
    #[serde(default, deserialize_with = "scalar_as_text")]
    pub status: Option<String>,
    #[serde(default)]
    pub health_timestamp: Option<String>,
    #[serde(default)]
    pub battery_percentage: Option<f64>,
}

/// Accepts any JSON scalar and keeps its text form; `status` is stored as
/// reported and never interpreted by the listener.
fn scalar_as_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(Some(v.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "expected a scalar, found {}",
            other
        ))),
    }
}

/// How a heartbeat is merged into the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatPolicy {
    /// Write all three liveness fields, nulls included.
    #[default]
    Overwrite,
    /// Write only the fields the device actually sent.
    PresentOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatUpdate {
    pub status: Option<String>,
    pub health_timestamp: Option<String>,
    pub battery_percentage: Option<f64>,
    pub policy: HeartbeatPolicy,
}

impl HeartbeatUpdate {
    pub fn from_message(message: &HeartbeatMessage, policy: HeartbeatPolicy) -> Self {
        Self {
            status: message.status.clone(),
            health_timestamp: message.health_timestamp.clone(),
            battery_percentage: message.battery_percentage,
            policy,
        }
    }

    /// True when applying the update would not change anything.
    pub fn is_noop(&self) -> bool {
        self.policy == HeartbeatPolicy::PresentOnly
            && self.status.is_none()
            && self.health_timestamp.is_none()
            && self.battery_percentage.is_none()
    }

    pub fn apply_to(&self, record: &mut DeviceRecord) {
        match self.policy {
            HeartbeatPolicy::Overwrite => {
                record.status = self.status.clone();
                record.health_timestamp = self.health_timestamp.clone();
                record.battery_percentage = self.battery_percentage;
            }
            HeartbeatPolicy::PresentOnly => {
                if let Some(status) = &self.status {
                    record.status = Some(status.clone());
                }
                if let Some(ts) = &self.health_timestamp {
                    record.health_timestamp = Some(ts.clone());
                }
                if let Some(battery) = self.battery_percentage {
                    record.battery_percentage = Some(battery);
                }
            }
        }
    }
}

/// Parses a stored `health_timestamp`.
pub fn parse_health_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, HEALTH_TIMESTAMP_FORMAT).ok()
}

pub fn format_health_timestamp(ts: NaiveDateTime) -> String {
    ts.format(HEALTH_TIMESTAMP_FORMAT).to_string()
}
