//! Periodic liveness sweep.
//!
//! Each cycle takes a snapshot of connected devices and demotes those whose
//! last heartbeat is older than the staleness threshold. The demotion is a
//! compare-and-set on the `health_timestamp` seen in the snapshot, so a
//! heartbeat that lands between the snapshot and the write wins.

use crate::config::SweepConfig;
use crate::errors::Result;
use crate::metrics::{DEVICES_DISCONNECTED_TOTAL, STORE_FAILURES_TOTAL, SWEEP_DURATION_SECONDS};
use crate::model::parse_health_timestamp;
use crate::store::DeviceStore;
use chrono::{NaiveDateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Connected devices in the snapshot.
    pub checked: usize,
    pub disconnected: Vec<String>,
    /// Missing or unparseable `health_timestamp`.
    pub skipped: Vec<String>,
    /// Stale in the snapshot but refreshed before the write.
    pub superseded: Vec<String>,
    pub failed: Vec<String>,
}

/// Runs one sweep against `now`, a naive UTC timestamp.
pub async fn sweep_once(
    store: &dyn DeviceStore,
    stale_after: Duration,
    now: NaiveDateTime,
) -> Result<SweepReport> {
    let devices = store.connected_devices().await.map_err(|e| {
        STORE_FAILURES_TOTAL.inc();
        e
    })?;

    let mut report = SweepReport {
        checked: devices.len(),
        ..Default::default()
    };

    if devices.is_empty() {
        warn!("No connected devices found.");
        return Ok(report);
    }

    for device in devices {
        let Some(raw) = device.health_timestamp.as_deref() else {
            warn!("Device {} has no health timestamp.", device.device_id);
            report.skipped.push(device.device_id);
            continue;
        };

        let Some(last_seen) = parse_health_timestamp(raw) else {
            warn!(
                "Device {} has unparseable health timestamp {:?}, skipping",
                device.device_id, raw
            );
            report.skipped.push(device.device_id);
            continue;
        };

        // A timestamp ahead of `now` is not stale.
        let elapsed = match (now - last_seen).to_std() {
            Ok(elapsed) => elapsed,
            Err(_) => continue,
        };
        if elapsed <= stale_after {
            continue;
        }

        match store.mark_disconnected(&device.device_id, raw).await {
            Ok(true) => {
                DEVICES_DISCONNECTED_TOTAL.inc();
                info!(
                    "Device {} marked as disconnected (last heartbeat {}s ago).",
                    device.device_id,
                    elapsed.as_secs()
                );
                report.disconnected.push(device.device_id);
            }
            Ok(false) => {
                debug!(
                    "Device {} changed since the sweep snapshot, leaving it alone",
                    device.device_id
                );
                report.superseded.push(device.device_id);
            }
            Err(e) => {
                STORE_FAILURES_TOTAL.inc();
                error!("Failed to disconnect device {}: {}", device.device_id, e);
                report.failed.push(device.device_id);
            }
        }
    }

    Ok(report)
}

/// Sweeps every `config.interval` until cancelled.
pub async fn run_sweeper(
    store: Arc<dyn DeviceStore>,
    config: SweepConfig,
    cancel: CancellationToken,
) {
    info!(
        "Starting liveness sweeper with interval={:?}, stale_after={:?}",
        config.interval, config.stale_after
    );

    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                info!("Checking device health...");
                let start = Instant::now();
                match sweep_once(store.as_ref(), config.stale_after, Utc::now().naive_utc()).await {
                    Ok(report) => {
                        debug!(
                            "Sweep checked {} devices: {} disconnected, {} skipped, {} superseded, {} failed",
                            report.checked,
                            report.disconnected.len(),
                            report.skipped.len(),
                            report.superseded.len(),
                            report.failed.len()
                        );
                    }
                    Err(e) => error!("Liveness sweep failed: {}", e),
                }
                SWEEP_DURATION_SECONDS.observe(start.elapsed().as_secs_f64());
            }
        }
    }

    info!("Sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{format_health_timestamp, DeviceRecord};
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn device(device_id: &str, status: &str, age_secs: Option<i64>) -> DeviceRecord {
        let mut record = DeviceRecord::new(device_id);
        record.status = Some(status.to_string());
        record.health_timestamp =
            age_secs.map(|age| format_health_timestamp(now() - chrono::Duration::seconds(age)));
        record
    }

    const THRESHOLD: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_stale_device_is_disconnected() {
        let store = MemoryStore::with_devices([device("D1", "connected", Some(45))]);

        let report = sweep_once(&store, THRESHOLD, now()).await.unwrap();

        assert_eq!(report.disconnected, vec!["D1".to_string()]);
        assert_eq!(store.get("D1").unwrap().status.as_deref(), Some("disconnected"));
    }

    #[tokio::test]
    async fn test_fresh_device_is_untouched() {
        let store = MemoryStore::with_devices([
            device("D1", "connected", Some(10)),
            device("D2", "connected", Some(30)),
        ]);

        let report = sweep_once(&store, THRESHOLD, now()).await.unwrap();

        assert_eq!(report.checked, 2);
        assert!(report.disconnected.is_empty());
        assert_eq!(store.write_calls(), 0);
        assert!(store.get("D2").unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_missing_or_bad_timestamp_is_skipped() {
        let mut garbled = device("D2", "connected", None);
        garbled.health_timestamp = Some("yesterday".to_string());
        let store = MemoryStore::with_devices([device("D1", "connected", None), garbled]);

        let report = sweep_once(&store, THRESHOLD, now()).await.unwrap();

        assert_eq!(report.skipped, vec!["D1".to_string(), "D2".to_string()]);
        assert!(store.get("D1").unwrap().is_connected());
        assert!(store.get("D2").unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_only_connected_devices_are_swept() {
        let store = MemoryStore::with_devices([device("D1", "disconnected", Some(300))]);

        let report = sweep_once(&store, THRESHOLD, now()).await.unwrap();

        assert_eq!(report.checked, 0);
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_future_timestamp_is_not_stale() {
        let store = MemoryStore::with_devices([device("D1", "connected", Some(-120))]);
        let report = sweep_once(&store, THRESHOLD, now()).await.unwrap();
        assert!(report.disconnected.is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_does_not_abort_sweep() {
        let store = MemoryStore::with_devices([
            device("D1", "connected", Some(60)),
            device("D2", "connected", Some(60)),
        ]);
        store.fail_next_writes(1);

        let report = sweep_once(&store, THRESHOLD, now()).await.unwrap();

        assert_eq!(report.failed, vec!["D1".to_string()]);
        assert_eq!(report.disconnected, vec!["D2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeper_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sweeper(
            store,
            SweepConfig::default(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
