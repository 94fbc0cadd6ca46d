use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::services::model_manager::ModelStatus;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    engine: String,
    loaded_models: Vec<String>,
    available_models: usize,
    uptime: u64,
}

/// Liveness plus residency. Read-only: never loads a model.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let manager = state.model_manager();
    Json(HealthResponse {
        status: "ok",
        engine: manager.engine_name().to_string(),
        loaded_models: manager
            .list_resident()
            .into_iter()
            .filter(|r| r.status == ModelStatus::Ready)
            .map(|r| r.name)
            .collect(),
        available_models: state.registry().snapshot().len(),
        uptime: state.uptime_secs(),
    })
}
