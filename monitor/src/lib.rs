//! Device telemetry ingestion and liveness monitoring.
//!
//! Telemetry arrives on `devices/{device_id}/data` and is applied by a bounded
//! worker pool; health reports arrive on a shared topic and are applied inline;
//! a periodic sweeper demotes devices whose heartbeats have gone stale.

pub mod config;
pub mod db;
pub mod errors;
pub mod heartbeat;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod pool;
pub mod rest;
pub mod store;
pub mod sweeper;
pub mod validate;
