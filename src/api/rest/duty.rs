use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::rest::identity::OperatorIdentity;
use crate::engine::session::TrackingStatus;
use crate::error::AppError;
use crate::models::coordinate::{Coordinate, PositionSample};
use crate::models::duty::{Duty, DutyState};
use crate::source::SensorError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/duty/start", post(start_duty))
        .route("/duty/end", post(end_duty))
        .route("/duty/current", get(current_duty))
        .route("/duty/route", get(route))
        .route("/duty/positions", post(push_position))
        .route("/duty/positions/error", post(push_sensor_error))
}

#[derive(Deserialize)]
pub struct LocationRequest {
    pub location: Coordinate,
}

#[derive(Deserialize)]
pub struct PositionRequest {
    pub location: Coordinate,
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorErrorKind {
    PermissionDenied,
    Unavailable,
    Timeout,
}

#[derive(Deserialize)]
pub struct SensorErrorRequest {
    pub kind: SensorErrorKind,
    #[serde(default)]
    pub message: String,
}

#[derive(Serialize)]
pub struct CurrentDutyResponse {
    pub state: DutyState,
    pub duty: Option<Duty>,
    pub tracking: Option<TrackingStatus>,
}

#[derive(Serialize)]
pub struct RouteResponse {
    pub distance_km: f64,
    pub route: Vec<Coordinate>,
}

async fn start_duty(
    State(state): State<Arc<AppState>>,
    OperatorIdentity(operator_id): OperatorIdentity,
    Json(payload): Json<LocationRequest>,
) -> Result<Json<Duty>, AppError> {
    let duty = state.duties.start_duty(&operator_id, payload.location).await?;
    Ok(Json(duty))
}

async fn end_duty(
    State(state): State<Arc<AppState>>,
    OperatorIdentity(operator_id): OperatorIdentity,
    Json(payload): Json<LocationRequest>,
) -> Result<Json<Duty>, AppError> {
    let duty = state.duties.end_duty(&operator_id, payload.location).await?;
    Ok(Json(duty))
}

async fn current_duty(
    State(state): State<Arc<AppState>>,
    OperatorIdentity(operator_id): OperatorIdentity,
) -> Result<Json<CurrentDutyResponse>, AppError> {
    // A client reloading mid-duty lands here first; pick tracking back up.
    let duty = state.duties.refresh(&operator_id).await?;
    Ok(Json(CurrentDutyResponse {
        state: duty.as_ref().map_or(DutyState::Idle, Duty::state),
        duty,
        tracking: state.sessions.status(&operator_id),
    }))
}

async fn route(
    State(state): State<Arc<AppState>>,
    OperatorIdentity(operator_id): OperatorIdentity,
) -> Result<Json<RouteResponse>, AppError> {
    let route = state
        .sessions
        .route(&operator_id)
        .ok_or(AppError::NoActiveDuty)?;
    let distance_km = state.sessions.distance_km(&operator_id).unwrap_or(0.0);

    Ok(Json(RouteResponse { distance_km, route }))
}

async fn push_position(
    State(state): State<Arc<AppState>>,
    OperatorIdentity(operator_id): OperatorIdentity,
    Json(payload): Json<PositionRequest>,
) -> Result<StatusCode, AppError> {
    payload.location.validate()?;

    let sample = PositionSample {
        coordinate: payload.location,
        recorded_at: payload.recorded_at.unwrap_or_else(|| state.clock.now()),
    };
    state.positions.push(&operator_id, sample).await?;

    Ok(StatusCode::ACCEPTED)
}

async fn push_sensor_error(
    State(state): State<Arc<AppState>>,
    OperatorIdentity(operator_id): OperatorIdentity,
    Json(payload): Json<SensorErrorRequest>,
) -> Result<StatusCode, AppError> {
    let error = match payload.kind {
        SensorErrorKind::PermissionDenied => SensorError::PermissionDenied(payload.message),
        SensorErrorKind::Unavailable => SensorError::Unavailable(payload.message),
        SensorErrorKind::Timeout => SensorError::Timeout,
    };
    state.positions.report_error(&operator_id, error).await?;

    Ok(StatusCode::ACCEPTED)
}
