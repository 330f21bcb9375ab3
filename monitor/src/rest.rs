use crate::store::DeviceStore;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
struct AppState {
    store: Arc<dyn DeviceStore>,
}

/// Read-only view of device state for downstream consumers.
pub fn create_router(store: Arc<dyn DeviceStore>) -> Router {
    let state = AppState { store };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/devices/:device_id/:value_type", get(get_device_value))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_device_value(
    State(state): State<AppState>,
    Path((device_id, value_type)): Path<(String, String)>,
) -> Result<Json<Value>, AppError> {
    let device = state
        .store
        .find_device(&device_id)
        .await?
        .ok_or(AppError::NotFound("Device not found".to_string()))?;

    let value = device.field(&value_type).ok_or_else(|| {
        AppError::BadRequest(format!("Invalid value type '{}' requested", value_type))
    })?;

    let mut body = serde_json::Map::new();
    body.insert(value_type, value);
    body.insert("timestamp".to_string(), json!(device.data_timestamp));
    Ok(Json(Value::Object(body)))
}

enum AppError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(detail) => {
                (StatusCode::NOT_FOUND, Json(json!({ "detail": detail }))).into_response()
            }
            AppError::BadRequest(detail) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "detail": detail }))).into_response()
            }
            AppError::Internal(e) => {
                error!("API error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {}", e),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}
