use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("duty already active for today")]
    AlreadyActive,

    #[error("no active duty")]
    NoActiveDuty,

    #[error("duty already completed for today")]
    DutyCompleted,

    #[error("location tracking already running")]
    AlreadyTracking,

    #[error("location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("missing operator identity")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            // Only reachable when two starts race past the per-operator lock,
            // e.g. from separate processes sharing one store.
            StoreError::DutyExists { .. } => AppError::AlreadyActive,
            StoreError::NotFound(id) => AppError::Internal(format!("duty {id} vanished from store")),
            StoreError::Unavailable(msg) => AppError::StoreUnavailable(msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::AlreadyActive
            | AppError::NoActiveDuty
            | AppError::DutyCompleted
            | AppError::AlreadyTracking => StatusCode::CONFLICT,
            AppError::LocationUnavailable(_) | AppError::StoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::InvalidCoordinate(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}
