//! The device store seam.
//!
//! Everything the monitor does to device state goes through [`DeviceStore`].
//! `db::PgDeviceStore` is the production implementation; [`MemoryStore`]
//! backs tests and local runs without a database.

use crate::errors::{Error, Result};
use crate::model::{DeviceRecord, DeviceStatus, HeartbeatUpdate, TelemetryUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// A message that could not be applied after all store retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub topic: String,
    pub payload: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(topic: &str, payload: &[u8], reason: impl Into<String>) -> Self {
        Self {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Returns the full record, or `None` if the device is not registered.
    async fn find_device(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    /// Sets the present telemetry fields in one atomic update. Returns `false`
    /// if no record matched.
    async fn update_telemetry(&self, device_id: &str, update: &TelemetryUpdate) -> Result<bool>;

    /// Applies a heartbeat. Returns `false` if no record matched.
    async fn update_heartbeat(&self, device_id: &str, update: &HeartbeatUpdate) -> Result<bool>;

    /// Snapshot of all devices whose status is `connected`.
    async fn connected_devices(&self) -> Result<Vec<DeviceRecord>>;

    /// Sets `status = disconnected` only if the device is still connected and
    /// its `health_timestamp` still equals `observed_health_timestamp`.
    /// Returns `false` when the guard did not hold.
    async fn mark_disconnected(&self, device_id: &str, observed_health_timestamp: &str)
        -> Result<bool>;

    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()>;

    /// Releases connections. Default is a no-op.
    async fn close(&self) {}
}

/// In-process store keyed by device id.
///
/// Counts every write call it receives and can be told to fail the next N
/// writes, which is what the pipeline tests assert against.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: Mutex<HashMap<String, DeviceRecord>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    write_calls: AtomicUsize,
    failing_writes: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(records: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    /// Registers a device. Only used by whoever owns registration; the
    /// pipeline never calls this.
    pub fn insert(&self, record: DeviceRecord) {
        lock(&self.devices).insert(record.device_id.clone(), record);
    }

    pub fn remove(&self, device_id: &str) -> Option<DeviceRecord> {
        lock(&self.devices).remove(device_id)
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        lock(&self.devices).get(device_id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.devices).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of mutating calls received, including failed ones.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.dead_letters).clone()
    }

    fn begin_write(&self) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(Error::StoreUnavailable("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn find_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        Ok(self.get(device_id))
    }

    async fn update_telemetry(&self, device_id: &str, update: &TelemetryUpdate) -> Result<bool> {
        self.begin_write()?;
        let mut devices = lock(&self.devices);
        match devices.get_mut(device_id) {
            Some(record) => {
                update.apply_to(record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_heartbeat(&self, device_id: &str, update: &HeartbeatUpdate) -> Result<bool> {
        self.begin_write()?;
        let mut devices = lock(&self.devices);
        match devices.get_mut(device_id) {
            Some(record) => {
                update.apply_to(record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn connected_devices(&self) -> Result<Vec<DeviceRecord>> {
        let devices = lock(&self.devices);
        let mut connected: Vec<DeviceRecord> = devices
            .values()
            .filter(|record| record.is_connected())
            .cloned()
            .collect();
        connected.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(connected)
    }

    async fn mark_disconnected(
        &self,
        device_id: &str,
        observed_health_timestamp: &str,
    ) -> Result<bool> {
        self.begin_write()?;
        let mut devices = lock(&self.devices);
        match devices.get_mut(device_id) {
            Some(record)
                if record.is_connected()
                    && record.health_timestamp.as_deref() == Some(observed_health_timestamp) =>
            {
                record.status = Some(DeviceStatus::Disconnected.as_str().to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        lock(&self.dead_letters).push(letter.clone());
        Ok(())
    }
}
