//! Telemetry processing and the per-message logging boundary.

use crate::config::ProcessingConfig;
use crate::errors::{Error, Result};
use crate::metrics::{
    record_failure, DEAD_LETTERS_TOTAL, PROCESS_LATENCY_SECONDS, STORE_FAILURES_TOTAL,
    TELEMETRY_APPLIED_TOTAL,
};
use crate::model::DeviceRecord;
use crate::store::{DeadLetter, DeviceStore};
use crate::validate::{decode_telemetry, DeviceMessage};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

/// Result of a message that made it to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied {
        device_id: String,
        fields: Vec<&'static str>,
    },
    /// The device existed at lookup time but was gone when the update ran.
    Vanished { device_id: String },
}

/// Applies one telemetry publish to the store.
pub async fn process_telemetry(
    store: &dyn DeviceStore,
    config: &ProcessingConfig,
    topic: &str,
    payload: &[u8],
) -> Result<Outcome> {
    let device_id = config
        .topics
        .telemetry_device_id(topic)
        .ok_or_else(|| Error::Validation(format!("No device id in topic {}", topic)))?;

    require_device(store, device_id).await?;

    let message = match decode_telemetry(device_id, payload).into_result()? {
        DeviceMessage::Telemetry(message) => message,
        other => {
            return Err(Error::Validation(format!(
                "Expected telemetry on {}, decoded {:?}",
                topic, other
            )))
        }
    };

    let fields = message.update.fields();
    if fields.is_empty() {
        return Err(Error::NoAcceptedFields(message.device_id));
    }

    let matched = retry_store_write(config.store_retries, || {
        store.update_telemetry(&message.device_id, &message.update)
    })
    .await?;

    if matched {
        Ok(Outcome::Applied {
            device_id: message.device_id,
            fields,
        })
    } else {
        Ok(Outcome::Vanished {
            device_id: message.device_id,
        })
    }
}

/// Runs telemetry processing under the message deadline and reports the
/// result. This is the only place a telemetry outcome is logged.
pub async fn handle_telemetry(
    store: &dyn DeviceStore,
    config: &ProcessingConfig,
    topic: &str,
    payload: &[u8],
) -> Result<Outcome> {
    let start = Instant::now();
    let result = with_deadline(
        config.message_timeout,
        process_telemetry(store, config, topic, payload),
    )
    .await;
    PROCESS_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());

    if matches!(result, Ok(Outcome::Applied { .. })) {
        TELEMETRY_APPLIED_TOTAL.inc();
    }
    report("telemetry", store, topic, payload, &result).await;
    result
}

pub(crate) async fn require_device(store: &dyn DeviceStore, device_id: &str) -> Result<DeviceRecord> {
    match store.find_device(device_id).await {
        Ok(Some(record)) => Ok(record),
        Ok(None) => Err(Error::DeviceNotFound(device_id.to_string())),
        Err(e) => {
            STORE_FAILURES_TOTAL.inc();
            Err(e)
        }
    }
}

pub(crate) async fn with_deadline<T>(
    deadline: Duration,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, work).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(deadline.as_millis() as u64)),
    }
}

/// Retries a store write with exponential backoff while the error is
/// transient, up to `attempts` calls in total.
pub(crate) async fn retry_store_write<T, F, Fut>(attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;

        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("Store write succeeded on attempt {}", attempt);
                }
                return Ok(value);
            }
            Err(e) => {
                STORE_FAILURES_TOTAL.inc();
                if attempt >= attempts || !e.is_retryable() {
                    return Err(e);
                }

                warn!(
                    "Store write failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, attempts, e, backoff_ms
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// Logs a message outcome once and hands store failures to the dead-letter
/// sink.
pub(crate) async fn report(
    kind: &str,
    store: &dyn DeviceStore,
    topic: &str,
    payload: &[u8],
    result: &Result<Outcome>,
) {
    match result {
        Ok(Outcome::Applied { device_id, fields }) => {
            info!("Updated {} {} with fields {:?}", kind, device_id, fields);
        }
        Ok(Outcome::Vanished { device_id }) => {
            warn!(
                "Device {} was removed before its {} update; nothing written",
                device_id, kind
            );
        }
        Err(e) if e.is_store_failure() => {
            error!("Failed to apply {} from {}: {}", kind, topic, e);
            let letter = DeadLetter::new(topic, payload, e.to_string());
            match store.dead_letter(&letter).await {
                Ok(()) => {
                    DEAD_LETTERS_TOTAL.inc();
                    debug!("Dead-lettered {} message from {}", kind, topic);
                }
                Err(dl_err) => {
                    error!(
                        "CRITICAL: {} message from {} lost, dead-letter write failed: {}",
                        kind, topic, dl_err
                    );
                }
            }
        }
        Err(e) => {
            record_failure(e);
            warn!("Dropped {} from {} ({}): {}", kind, topic, e.kind(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HeartbeatUpdate, TelemetryUpdate};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    /// Telemetry writes that take `delay` before reaching the inner store.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl DeviceStore for SlowStore {
        async fn find_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
            self.inner.find_device(device_id).await
        }

        async fn update_telemetry(&self, device_id: &str, update: &TelemetryUpdate) -> Result<bool> {
            tokio::time::sleep(self.delay).await;
            self.inner.update_telemetry(device_id, update).await
        }

        async fn update_heartbeat(&self, device_id: &str, update: &HeartbeatUpdate) -> Result<bool> {
            self.inner.update_heartbeat(device_id, update).await
        }

        async fn connected_devices(&self) -> Result<Vec<DeviceRecord>> {
            self.inner.connected_devices().await
        }

        async fn mark_disconnected(&self, device_id: &str, observed: &str) -> Result<bool> {
            self.inner.mark_disconnected(device_id, observed).await
        }

        async fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
            self.inner.dead_letter(letter).await
        }
    }

    fn store_with(device_id: &str) -> MemoryStore {
        MemoryStore::with_devices([DeviceRecord::new(device_id)])
    }

    #[test]
    fn test_process_message_valid() {
        tokio_test::block_on(async {
            let store = store_with("test-dev");
            let config = ProcessingConfig::default();
            let payload = br#"{"value1":1.5,"value3":3.0,"data_timestamp":"2024-05-01T10:00:00"}"#;

            let outcome = process_telemetry(&store, &config, "devices/test-dev/data", payload)
                .await
                .unwrap();
            assert_eq!(
                outcome,
                Outcome::Applied {
                    device_id: "test-dev".to_string(),
                    fields: vec!["value1", "value3", "data_timestamp"],
                }
            );

            let record = store.get("test-dev").unwrap();
            assert_eq!(record.value1, Some(1.5));
            assert_eq!(record.value2, None);
            assert_eq!(record.value3, Some(3.0));
            assert_eq!(record.data_timestamp.as_deref(), Some("2024-05-01T10:00:00"));
        });
    }

    #[test]
    fn test_process_message_invalid_json() {
        tokio_test::block_on(async {
            let store = store_with("test-dev");
            let result = process_telemetry(
                &store,
                &ProcessingConfig::default(),
                "devices/test-dev/data",
                b"invalid json",
            )
            .await;

            assert!(matches!(result, Err(Error::Validation(_))));
            assert_eq!(store.write_calls(), 0);
        });
    }

    #[test]
    fn test_unknown_device_is_not_found() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let result = process_telemetry(
                &store,
                &ProcessingConfig::default(),
                "devices/ghost/data",
                br#"{"value1":1}"#,
            )
            .await;

            assert!(matches!(result, Err(Error::DeviceNotFound(id)) if id == "ghost"));
            assert_eq!(store.write_calls(), 0);
            assert!(store.is_empty());
        });
    }

    #[test]
    fn test_no_accepted_fields_skips_write() {
        tokio_test::block_on(async {
            let store = store_with("D1");
            let result = process_telemetry(
                &store,
                &ProcessingConfig::default(),
                "devices/D1/data",
                br#"{"temperature":20.0,"status":"disconnected"}"#,
            )
            .await;

            assert!(matches!(result, Err(Error::NoAcceptedFields(_))));
            assert_eq!(store.write_calls(), 0);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let store = store_with("D1");
        store.fail_next_writes(2);

        let outcome = process_telemetry(
            &store,
            &ProcessingConfig::default(),
            "devices/D1/data",
            br#"{"value2":7}"#,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, Outcome::Applied { .. }));
        assert_eq!(store.write_calls(), 3);
        assert_eq!(store.get("D1").unwrap().value2, Some(7.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_are_dead_lettered() {
        let store = store_with("D1");
        store.fail_next_writes(10);
        let config = ProcessingConfig::default();

        let result = handle_telemetry(&store, &config, "devices/D1/data", br#"{"value2":7}"#).await;

        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
        assert_eq!(store.write_calls(), config.store_retries as usize);
        let letters = store.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].topic, "devices/D1/data");
        assert_eq!(letters[0].payload, r#"{"value2":7}"#);
    }

    #[tokio::test]
    async fn test_validation_failures_are_not_dead_lettered() {
        let store = store_with("D1");
        let _ = handle_telemetry(&store, &ProcessingConfig::default(), "devices/D1/data", b"{").await;
        assert!(store.dead_letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_write_hits_deadline_and_is_dead_lettered() {
        let store = SlowStore {
            inner: store_with("D1"),
            delay: Duration::from_secs(10),
        };
        let config = ProcessingConfig {
            message_timeout: Duration::from_secs(1),
            ..Default::default()
        };

        let result = handle_telemetry(&store, &config, "devices/D1/data", br#"{"value1":1}"#).await;

        assert!(matches!(result, Err(Error::Timeout(1000))));
        assert_eq!(store.inner.get("D1").unwrap().value1, None);
        let letters = store.inner.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].topic, "devices/D1/data");
        assert!(letters[0].reason.contains("timed out"));
    }
}
