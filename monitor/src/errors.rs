use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No accepted fields in message for device {0}")]
    NoAcceptedFields(String),

    #[error("Device {0} not found")]
    DeviceNotFound(String),

    #[error("Processing timed out after {0}ms")]
    Timeout(u64),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Work queue closed")]
    QueueClosed,
}

impl Error {
    /// Whether a retry of the same store call could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Database(db_err) => is_transient_db_error(db_err),
            Error::StoreUnavailable(_) => true,

            Error::Mqtt(_)
            | Error::Migration(_)
            | Error::Validation(_)
            | Error::NoAcceptedFields(_)
            | Error::DeviceNotFound(_)
            | Error::Timeout(_)
            | Error::Config(_)
            | Error::QueueClosed => false,
        }
    }

    /// Failures after which the message is dead-lettered rather than dropped.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::StoreUnavailable(_) | Error::Timeout(_)
        )
    }

    /// Short label used for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NoAcceptedFields(_) => "no_accepted_fields",
            Error::DeviceNotFound(_) => "not_found",
            Error::Database(_) | Error::StoreUnavailable(_) => "store_write",
            Error::Timeout(_) => "timeout",
            Error::Mqtt(_) => "mqtt",
            Error::Migration(_) | Error::Config(_) => "internal",
            Error::QueueClosed => "queue_closed",
        }
    }
}

fn is_transient_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code == "08000" || // connection_exception
            code == "08003" || // connection_does_not_exist
            code == "08006" || // connection_failure
            code == "57P03" || // cannot_connect_now
            code == "53300" // too_many_connections
        }),
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::StoreUnavailable("down".to_string()).is_retryable());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_retryable());
        assert!(!Error::Validation("test".to_string()).is_retryable());
        assert!(!Error::DeviceNotFound("D1".to_string()).is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Validation("x".into()).kind(), "validation");
        assert_eq!(Error::DeviceNotFound("D1".into()).kind(), "not_found");
        assert_eq!(Error::NoAcceptedFields("D1".into()).kind(), "no_accepted_fields");
        assert_eq!(Error::StoreUnavailable("x".into()).kind(), "store_write");
    }

    #[test]
    fn test_store_failures_are_dead_lettered() {
        assert!(Error::Timeout(5000).is_store_failure());
        assert!(!Error::Timeout(5000).is_retryable());
        assert!(Error::StoreUnavailable("down".into()).is_store_failure());
        assert!(!Error::Validation("bad".into()).is_store_failure());
        assert!(!Error::QueueClosed.is_store_failure());
        assert_eq!(Error::Timeout(5000).kind(), "timeout");
        assert_eq!(Error::Config("x".into()).kind(), "internal");
    }
}
