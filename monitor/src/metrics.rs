use crate::errors::Error;
use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref TELEMETRY_RECEIVED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_telemetry_received_total",
        "Total telemetry messages received from MQTT"
    ))
    .expect("valid metric");
    pub static ref TELEMETRY_APPLIED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_telemetry_applied_total",
        "Total telemetry messages written to the device store"
    ))
    .expect("valid metric");
    pub static ref HEARTBEATS_RECEIVED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_heartbeats_received_total",
        "Total health reports received from MQTT"
    ))
    .expect("valid metric");
    pub static ref HEARTBEATS_APPLIED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_heartbeats_applied_total",
        "Total health reports written to the device store"
    ))
    .expect("valid metric");
    pub static ref INVALID_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_invalid_messages_total",
        "Total messages dropped as malformed or without accepted fields"
    ))
    .expect("valid metric");
    pub static ref UNKNOWN_DEVICE_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_unknown_device_total",
        "Total messages dropped because the device is not registered"
    ))
    .expect("valid metric");
    pub static ref STORE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_store_failures_total",
        "Total failed device store calls, retries included"
    ))
    .expect("valid metric");
    pub static ref DEAD_LETTERS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_dead_letters_total",
        "Total messages handed to the dead-letter sink"
    ))
    .expect("valid metric");
    pub static ref QUEUE_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_queue_full_total",
        "Total number of times the work queue was full (backpressure events)"
    ))
    .expect("valid metric");
    pub static ref SHED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_shed_messages_total",
        "Total telemetry messages dropped because the work queue was full"
    ))
    .expect("valid metric");
    pub static ref QUEUE_DEPTH: Gauge = Gauge::with_opts(Opts::new(
        "monitor_queue_depth",
        "Telemetry messages waiting for a worker"
    ))
    .expect("valid metric");
    pub static ref DEVICES_DISCONNECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_devices_disconnected_total",
        "Total devices transitioned to disconnected by the sweeper"
    ))
    .expect("valid metric");
    pub static ref PROCESS_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "monitor_process_latency_seconds",
            "Time taken to process one telemetry message"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .expect("valid metric");
    pub static ref SWEEP_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "monitor_sweep_duration_seconds",
            "Time taken by one liveness sweep"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    )
    .expect("valid metric");
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(TELEMETRY_RECEIVED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TELEMETRY_APPLIED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(HEARTBEATS_RECEIVED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(HEARTBEATS_APPLIED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INVALID_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UNKNOWN_DEVICE_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEAD_LETTERS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_FULL_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SHED_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(DEVICES_DISCONNECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PROCESS_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(SWEEP_DURATION_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Records the drop reason of a failed message.
pub fn record_failure(err: &Error) {
    match err {
        Error::Validation(_) | Error::NoAcceptedFields(_) => {
            INVALID_MESSAGES_TOTAL.inc()
        }
        Error::DeviceNotFound(_) => UNKNOWN_DEVICE_TOTAL.inc(),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_registered_metrics() {
        // Registration is global; a second registration from another test is fine to ignore.
        let _ = init_metrics();
        TELEMETRY_RECEIVED_TOTAL.inc();
        let text = gather_metrics();
        assert!(text.contains("monitor_telemetry_received_total"));
    }
}
