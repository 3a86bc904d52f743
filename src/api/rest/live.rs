use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Json;
use axum::Router;

use crate::models::live_location::LiveLocationEntry;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/live-locations", get(list_live_locations))
}

async fn list_live_locations(State(state): State<Arc<AppState>>) -> Json<Vec<LiveLocationEntry>> {
    Json(state.registry.snapshot())
}
