// Live-broker tests. They need an MQTT broker on localhost:1883 and run the
// monitor's own listeners against an in-memory store:
//
//     cargo test --test load_test -- --ignored --nocapture

use chrono::{Duration as ChronoDuration, Utc};
use device_monitor::config::{Backpressure, MqttConfig, PoolConfig, ProcessingConfig};
use device_monitor::model::{format_health_timestamp, DeviceRecord};
use device_monitor::mqtt::{run_heartbeat_listener, run_telemetry_listener};
use device_monitor::pool::WorkerPool;
use device_monitor::store::MemoryStore;
use device_monitor::sweeper::sweep_once;
use device_monitor::validate::Topics;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const BROKER: &str = "localhost";
const PORT: u16 = 1883;

#[derive(Debug, Clone, Serialize)]
struct Telemetry {
    value1: f64,
    value2: f64,
    value3: f64,
    data_timestamp: String,
}

impl Telemetry {
    fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        Self {
            value1: rng.gen_range(15.0..35.0),
            value2: rng.gen_range(30.0..80.0),
            value3: rng.gen_range(20.0..100.0),
            data_timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct Heartbeat {
    device_id: String,
    status: &'static str,
    health_timestamp: String,
    battery_percentage: f64,
}

/// Topics under a per-run root so parallel runs on a shared broker do not
/// see each other's traffic.
fn run_topics() -> Topics {
    let root = format!("load-{}", uuid::Uuid::new_v4());
    Topics {
        telemetry: format!("{}/devices/+/data", root),
        health: format!("{}/device/health", root),
    }
}

fn mqtt_config(role: &str) -> MqttConfig {
    MqttConfig {
        broker: BROKER.to_string(),
        port: PORT,
        client_id_prefix: format!("load-test-{}-{}", role, uuid::Uuid::new_v4()),
    }
}

fn publisher(name: &str) -> AsyncClient {
    let mut mqtt_options = MqttOptions::new(
        format!("{}-{}", name, uuid::Uuid::new_v4()),
        BROKER,
        PORT,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                eprintln!("MQTT error: {}", e);
                break;
            }
        }
    });
    client
}

async fn wait_for_writes(store: &MemoryStore, expected: usize, limit: Duration) {
    let start = Instant::now();
    while store.write_calls() < expected && start.elapsed() < limit {
        sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
#[ignore]
async fn telemetry_load_reaches_registered_devices() {
    let devices = 10;
    let total_messages = 5000;
    println!("\nTelemetry load: {} messages over {} devices", total_messages, devices);

    let store = Arc::new(MemoryStore::with_devices(
        (0..devices).map(|i| DeviceRecord::new(format!("load-test-dev-{}", i))),
    ));
    let processing = ProcessingConfig {
        topics: run_topics(),
        ..Default::default()
    };
    let pool = WorkerPool::start(
        store.clone(),
        processing.clone(),
        PoolConfig {
            workers: 10,
            queue_capacity: 10_000,
            backpressure: Backpressure::Block,
        },
    );
    let cancel = CancellationToken::new();
    let listener = tokio::spawn(run_telemetry_listener(
        mqtt_config("telemetry"),
        processing.clone(),
        pool,
        cancel.clone(),
    ));
    sleep(Duration::from_secs(1)).await;

    let client = publisher("load-test-pub");
    let start = Instant::now();
    for n in 0..total_messages {
        let device_id = format!("load-test-dev-{}", n % devices);
        let topic = processing.topics.telemetry.replace('+', &device_id);
        let payload = serde_json::to_string(&Telemetry::random()).unwrap();
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .unwrap();
    }
    // A few unregistered ids mixed in must never create records.
    for n in 0..20 {
        let topic = processing
            .topics
            .telemetry
            .replace('+', &format!("unregistered-{}", n));
        client
            .publish(topic, QoS::AtLeastOnce, false, r#"{"value1":1}"#)
            .await
            .unwrap();
    }

    wait_for_writes(&store, total_messages, Duration::from_secs(60)).await;
    let duration = start.elapsed();
    cancel.cancel();
    listener.await.unwrap().unwrap();

    println!(
        "  Applied {} writes in {:.2}s ({:.0} msg/s)",
        store.write_calls(),
        duration.as_secs_f64(),
        store.write_calls() as f64 / duration.as_secs_f64()
    );

    assert_eq!(store.write_calls(), total_messages);
    assert_eq!(store.len(), devices);
    for i in 0..devices {
        let record = store.get(&format!("load-test-dev-{}", i)).unwrap();
        assert!(record.value1.is_some());
        assert!(record.value2.is_some());
        assert!(record.value3.is_some());
        assert!(record.data_timestamp.is_some());
        assert_eq!(record.status, None);
    }
}

#[tokio::test]
#[ignore]
async fn heartbeat_burst_then_sweep() {
    let devices = 500;
    println!("\nHeartbeat burst: {} devices, half of them stale", devices);

    let store = Arc::new(MemoryStore::with_devices(
        (0..devices).map(|i| DeviceRecord::new(format!("load-test-dev-{}", i))),
    ));
    let processing = ProcessingConfig {
        topics: run_topics(),
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let listener = tokio::spawn(run_heartbeat_listener(
        mqtt_config("health"),
        processing.clone(),
        store.clone(),
        cancel.clone(),
    ));
    sleep(Duration::from_secs(1)).await;

    let now = Utc::now().naive_utc();
    let fresh = format_health_timestamp(now);
    let stale = format_health_timestamp(now - ChronoDuration::seconds(120));

    let client = publisher("load-test-health");
    let start = Instant::now();
    for i in 0..devices {
        let heartbeat = Heartbeat {
            device_id: format!("load-test-dev-{}", i),
            status: "connected",
            health_timestamp: if i % 2 == 0 { stale.clone() } else { fresh.clone() },
            battery_percentage: 90.0,
        };
        let payload = serde_json::to_string(&heartbeat).unwrap();
        client
            .publish(processing.topics.health.clone(), QoS::AtLeastOnce, false, payload)
            .await
            .unwrap();
    }

    wait_for_writes(&store, devices, Duration::from_secs(30)).await;
    println!("  Applied {} heartbeats in {:.2}s", store.write_calls(), start.elapsed().as_secs_f64());
    cancel.cancel();
    listener.await.unwrap().unwrap();

    let report = sweep_once(&*store, Duration::from_secs(30), now)
        .await
        .unwrap();

    assert_eq!(report.checked, devices);
    assert_eq!(report.disconnected.len(), devices / 2);
    assert!(report.skipped.is_empty());
    for i in 0..devices {
        let record = store.get(&format!("load-test-dev-{}", i)).unwrap();
        assert_eq!(record.is_connected(), i % 2 == 1);
    }
}
