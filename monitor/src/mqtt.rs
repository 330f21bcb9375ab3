use crate::config::{MqttConfig, ProcessingConfig};
use crate::errors::{Error, Result};
use crate::heartbeat::handle_heartbeat;
use crate::metrics::{HEARTBEATS_RECEIVED_TOTAL, TELEMETRY_RECEIVED_TOTAL};
use crate::pool::{Job, WorkerPool};
use crate::store::DeviceStore;
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 10000;

fn mqtt_options(config: &MqttConfig, role: &str) -> MqttOptions {
    let client_id = format!("{}-{}", config.client_id_prefix, role);
    let mut mqtt_options = MqttOptions::new(client_id, config.broker.clone(), config.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);
    mqtt_options
}

/// Subscribes once the broker has accepted the connection, so the
/// subscription is renewed after every reconnect.
fn on_connack(client: &AsyncClient, topic: &str, ack: &ConnAck) -> Result<()> {
    info!("Connection result code: {:?}", ack.code);
    if ack.code != ConnectReturnCode::Success {
        error!("Failed to connect, return code {:?}", ack.code);
        return Ok(());
    }

    info!("Connected to MQTT broker");
    client
        .try_subscribe(topic, QoS::AtLeastOnce)
        .map_err(Error::Mqtt)?;
    info!("Subscribed to {} with QoS 1", topic);
    Ok(())
}

/// Sends DISCONNECT and polls until it has gone out, for at most a second.
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop, role: &str) {
    if let Err(e) = client.try_disconnect() {
        warn!("{} listener disconnect failed: {}", role, e);
        return;
    }

    let flushed = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        warn!("{} listener did not disconnect cleanly", role);
    }
}

/// Receives telemetry and hands each publish to the worker pool. Store I/O
/// never happens on this loop. On cancellation the pool is drained before
/// returning.
pub async fn run_telemetry_listener(
    config: MqttConfig,
    processing: ProcessingConfig,
    pool: WorkerPool,
    cancel: CancellationToken,
) -> Result<()> {
    info!(
        "Connecting telemetry listener to MQTT broker at {}:{}",
        config.broker, config.port
    );
    let (client, mut eventloop) =
        AsyncClient::new(mqtt_options(&config, "telemetry"), REQUEST_CHANNEL_CAPACITY);
    let topic = processing.topics.telemetry.clone();

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if let Err(e) = on_connack(&client, &topic, &ack) {
                        break Err(e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    TELEMETRY_RECEIVED_TOTAL.inc();
                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );

                    let job = Job::new(publish.topic, publish.payload.to_vec());
                    if let Err(e) = pool.submit(job).await {
                        break Err(e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT error on telemetry listener: {}", e);
                    // rumqttc reconnects on the next poll
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    };

    disconnect(&client, &mut eventloop, "telemetry").await;
    pool.shutdown().await;
    info!("Telemetry listener stopped");
    result
}

/// Receives health reports and applies them inline; heartbeat volume is one
/// message per device per reporting period.
pub async fn run_heartbeat_listener(
    config: MqttConfig,
    processing: ProcessingConfig,
    store: Arc<dyn DeviceStore>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(
        "Connecting heartbeat listener to MQTT broker at {}:{}",
        config.broker, config.port
    );
    let (client, mut eventloop) =
        AsyncClient::new(mqtt_options(&config, "health"), REQUEST_CHANNEL_CAPACITY);
    let topic = processing.topics.health.clone();

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if let Err(e) = on_connack(&client, &topic, &ack) {
                        break Err(e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    HEARTBEATS_RECEIVED_TOTAL.inc();
                    debug!(
                        "Message received on topic {}: {}",
                        publish.topic,
                        String::from_utf8_lossy(&publish.payload)
                    );
                    let _ = handle_heartbeat(
                        store.as_ref(),
                        &processing,
                        &publish.topic,
                        &publish.payload,
                    )
                    .await;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT error on heartbeat listener: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    };

    disconnect(&client, &mut eventloop, "heartbeat").await;
    info!("Heartbeat listener stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MqttConfig {
        MqttConfig {
            broker: "broker.local".to_string(),
            port: 1884,
            client_id_prefix: "monitor-test".to_string(),
        }
    }

    #[test]
    fn test_client_ids_are_per_role() {
        let telemetry = mqtt_options(&config(), "telemetry");
        let health = mqtt_options(&config(), "health");

        assert_eq!(telemetry.client_id(), "monitor-test-telemetry");
        assert_eq!(health.client_id(), "monitor-test-health");
        assert_eq!(telemetry.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(telemetry.keep_alive(), Duration::from_secs(30));
        assert!(!telemetry.clean_session());
    }

    #[tokio::test]
    async fn test_failed_connack_does_not_subscribe() {
        let (client, _eventloop) = AsyncClient::new(mqtt_options(&config(), "telemetry"), 10);
        let ack = ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
        };
        assert!(on_connack(&client, "devices/+/data", &ack).is_ok());
    }

    #[tokio::test]
    async fn test_successful_connack_subscribes() {
        let (client, _eventloop) = AsyncClient::new(mqtt_options(&config(), "telemetry"), 10);
        let ack = ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        };
        assert!(on_connack(&client, "devices/+/data", &ack).is_ok());
    }
}
