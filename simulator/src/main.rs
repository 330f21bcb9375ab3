mod payload;

use clap::Parser;
use payload::{generate_heartbeat, generate_telemetry};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "simulator", about = "Publishes device telemetry and heartbeats")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    /// Telemetry messages per second across all devices.
    #[arg(long, env = "RATE", default_value_t = 1000)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 100)]
    devices: usize,

    /// Prefix of simulated device ids; ids are `{prefix}-{n}`.
    #[arg(long, env = "DEVICE_PREFIX", default_value = "dev")]
    device_prefix: String,

    #[arg(long, env = "HEALTH_TOPIC", default_value = "device/health")]
    health_topic: String,

    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value_t = 10)]
    heartbeat_interval_secs: u64,

    /// Share of devices that send one heartbeat and then go quiet.
    #[arg(long, env = "SILENT_FRACTION", default_value_t = 0.0)]
    silent_fraction: f64,
}

impl Args {
    fn device_id(&self, n: usize) -> String {
        format!("{}-{}", self.device_prefix, n)
    }

    fn silent_devices(&self) -> usize {
        (self.devices as f64 * self.silent_fraction.clamp(0.0, 1.0)).round() as usize
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting device simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {} ({} silent)",
        args.mqtt_broker,
        args.mqtt_port,
        args.rate,
        args.devices,
        args.silent_devices()
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());

    // Connect to MQTT broker
    let mut mqtt_options = MqttOptions::new(&client_id, &args.mqtt_broker, args.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    // Spawn eventloop handler
    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Connected to MQTT broker, starting to publish");

    tokio::spawn(publish_heartbeats(
        client.clone(),
        args.health_topic.clone(),
        (0..args.devices).map(|n| args.device_id(n)).collect(),
        args.silent_devices(),
        Duration::from_secs(args.heartbeat_interval_secs.max(1)),
    ));

    publish_telemetry(&client, &args).await;
}

async fn publish_telemetry(client: &AsyncClient, args: &Args) {
    let mut rng = rand::thread_rng();
    let mut counter = 0u64;

    const BURST_SIZE: usize = 200;
    let rate = args.rate.max(1);
    let burst_interval = Duration::from_millis((BURST_SIZE as u64 * 1000) / rate);

    info!(
        "Publishing telemetry in bursts of {} messages every {:?}",
        BURST_SIZE, burst_interval
    );

    loop {
        let burst_start = std::time::Instant::now();

        for _ in 0..BURST_SIZE {
            let device_id = args.device_id((counter % args.devices.max(1) as u64) as usize);
            let topic = format!("devices/{}/data", device_id);
            let payload = match serde_json::to_string(&generate_telemetry(&mut rng)) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize telemetry: {}", e);
                    continue;
                }
            };

            match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => {
                    counter += 1;
                }
                Err(e) => {
                    warn!("Failed to publish: {}", e);
                }
            }
        }

        // Log progress periodically
        if counter % 10000 == 0 {
            info!("Published {} telemetry messages", counter);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?} - system may be overloaded",
                elapsed, burst_interval
            );
        }
    }
}

/// The first `silent` devices report once and then stop, so the monitor's
/// sweeper has something to disconnect.
async fn publish_heartbeats(
    client: AsyncClient,
    topic: String,
    device_ids: Vec<String>,
    silent: usize,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    let mut round = 0u64;

    loop {
        ticker.tick().await;

        let mut sent = 0usize;
        for (n, device_id) in device_ids.iter().enumerate() {
            if round > 0 && n < silent {
                continue;
            }
            let heartbeat = generate_heartbeat(&mut rand::thread_rng(), device_id);
            let payload = match serde_json::to_string(&heartbeat) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize heartbeat: {}", e);
                    continue;
                }
            };

            match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                Ok(_) => sent += 1,
                Err(e) => warn!("Failed to publish heartbeat: {}", e),
            }
        }

        info!("Heartbeat round {}: {} devices reported", round, sent);
        round += 1;
    }
}
