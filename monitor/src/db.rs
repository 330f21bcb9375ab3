use crate::errors::Result;
use crate::model::{DeviceRecord, DeviceStatus, HeartbeatPolicy, HeartbeatUpdate, TelemetryUpdate};
use crate::store::{DeadLetter, DeviceStore};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

const DEVICE_COLUMNS: &str = "device_id, user_id, status, value1, value2, value3, \
     data_timestamp, health_timestamp, battery_percentage, created_at";

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Device store backed by the shared `devices` table.
#[derive(Debug, Clone)]
pub struct PgDeviceStore {
    pool: PgPool,
}

impl PgDeviceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(make_pool(database_url).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DeviceStore for PgDeviceStore {
    async fn find_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let query = format!("SELECT {} FROM devices WHERE device_id = $1", DEVICE_COLUMNS);
        let record = sqlx::query_as::<_, DeviceRecord>(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn update_telemetry(&self, device_id: &str, update: &TelemetryUpdate) -> Result<bool> {
        // Each field binds a presence flag and its value; a present null
        // clears the column, an absent key keeps it.
        let query = r#"
            UPDATE devices SET
                value1 = CASE WHEN $2 THEN $3 ELSE value1 END,
                value2 = CASE WHEN $4 THEN $5 ELSE value2 END,
                value3 = CASE WHEN $6 THEN $7 ELSE value3 END,
                data_timestamp = CASE WHEN $8 THEN $9 ELSE data_timestamp END
            WHERE device_id = $1
            "#;

        let result = sqlx::query(query)
            .bind(device_id)
            .bind(update.value1.is_some())
            .bind(update.value1.flatten())
            .bind(update.value2.is_some())
            .bind(update.value2.flatten())
            .bind(update.value3.is_some())
            .bind(update.value3.flatten())
            .bind(update.data_timestamp.is_some())
            .bind(update.data_timestamp.as_ref().and_then(|ts| ts.as_deref()))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_heartbeat(&self, device_id: &str, update: &HeartbeatUpdate) -> Result<bool> {
        let query = match update.policy {
            HeartbeatPolicy::Overwrite => {
                r#"
                UPDATE devices SET
                    status = $2,
                    health_timestamp = $3,
                    battery_percentage = $4
                WHERE device_id = $1
                "#
            }
            HeartbeatPolicy::PresentOnly => {
                r#"
                UPDATE devices SET
                    status = COALESCE($2, status),
                    health_timestamp = COALESCE($3, health_timestamp),
                    battery_percentage = COALESCE($4, battery_percentage)
                WHERE device_id = $1
                "#
            }
        };

        let result = sqlx::query(query)
            .bind(device_id)
            .bind(update.status.as_deref())
            .bind(update.health_timestamp.as_deref())
            .bind(update.battery_percentage)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn connected_devices(&self) -> Result<Vec<DeviceRecord>> {
        let query = format!(
            "SELECT {} FROM devices WHERE status = $1 ORDER BY device_id",
            DEVICE_COLUMNS
        );
        let records = sqlx::query_as::<_, DeviceRecord>(&query)
            .bind(DeviceStatus::Connected.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn mark_disconnected(
        &self,
        device_id: &str,
        observed_health_timestamp: &str,
    ) -> Result<bool> {
        let query = r#"
            UPDATE devices SET status = $2
            WHERE device_id = $1
              AND status = $3
              AND health_timestamp = $4
            "#;

        let result = sqlx::query(query)
            .bind(device_id)
            .bind(DeviceStatus::Disconnected.as_str())
            .bind(DeviceStatus::Connected.as_str())
            .bind(observed_health_timestamp)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        let query = r#"
            INSERT INTO dead_letters (topic, payload, reason, failed_at)
            VALUES ($1, $2, $3, $4)
            "#;

        sqlx::query(query)
            .bind(&letter.topic)
            .bind(&letter.payload)
            .bind(&letter.reason)
            .bind(letter.failed_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn close(&self) {
        info!("Closing database pool");
        self.pool.close().await;
    }
}
