use crate::config::ProcessingConfig;
use crate::errors::{Error, Result};
use crate::ingest::{report, require_device, retry_store_write, with_deadline, Outcome};
use crate::metrics::HEARTBEATS_APPLIED_TOTAL;
use crate::model::{HeartbeatPolicy, HeartbeatUpdate};
use crate::store::DeviceStore;
use crate::validate::{decode, DeviceMessage};

/// Applies one health report to the store.
///
/// The listener does not interpret `status`; whatever the device reports is
/// written. Only the sweeper ever decides a device is disconnected.
pub async fn process_heartbeat(
    store: &dyn DeviceStore,
    config: &ProcessingConfig,
    topic: &str,
    payload: &[u8],
) -> Result<Outcome> {
    let heartbeat = match decode(&config.topics, topic, payload).into_result()? {
        DeviceMessage::Heartbeat(heartbeat) => heartbeat,
        other => {
            return Err(Error::Validation(format!(
                "Expected heartbeat on {}, decoded {:?}",
                topic, other
            )))
        }
    };

    require_device(store, &heartbeat.device_id).await?;

    let update = HeartbeatUpdate::from_message(&heartbeat, config.heartbeat_policy);
    if update.is_noop() {
        return Err(Error::NoAcceptedFields(heartbeat.device_id));
    }

    let matched = retry_store_write(config.store_retries, || {
        store.update_heartbeat(&heartbeat.device_id, &update)
    })
    .await?;

    if !matched {
        return Ok(Outcome::Vanished {
            device_id: heartbeat.device_id,
        });
    }

    let fields = match config.heartbeat_policy {
        HeartbeatPolicy::Overwrite => vec!["status", "health_timestamp", "battery_percentage"],
        HeartbeatPolicy::PresentOnly => {
            let mut fields = Vec::with_capacity(3);
            if update.status.is_some() {
                fields.push("status");
            }
            if update.health_timestamp.is_some() {
                fields.push("health_timestamp");
            }
            if update.battery_percentage.is_some() {
                fields.push("battery_percentage");
            }
            fields
        }
    };

    Ok(Outcome::Applied {
        device_id: heartbeat.device_id,
        fields,
    })
}

/// Heartbeat counterpart of `ingest::handle_telemetry`.
pub async fn handle_heartbeat(
    store: &dyn DeviceStore,
    config: &ProcessingConfig,
    topic: &str,
    payload: &[u8],
) -> Result<Outcome> {
    let result = with_deadline(
        config.message_timeout,
        process_heartbeat(store, config, topic, payload),
    )
    .await;

    if matches!(result, Ok(Outcome::Applied { .. })) {
        HEARTBEATS_APPLIED_TOTAL.inc();
    }
    report("heartbeat", store, topic, payload, &result).await;
    result
}
