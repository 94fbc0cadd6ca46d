//! Admin routes: /admin/unload, /admin/reload, /api/models/resident

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::services::model_manager::{ResidentInfo, UnloadSummary, UnloadTarget};
use crate::services::registry::ReloadSummary;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/unload", post(unload))
        .route("/admin/reload", post(reload))
        .route("/api/models/resident", get(resident))
}

#[derive(Debug, Deserialize)]
struct UnloadRequest {
    #[serde(default)]
    model: Option<String>,
}

#[derive(Serialize)]
struct UnloadResponse {
    status: &'static str,
    message: String,
    unloaded_count: usize,
    busy_count: usize,
    #[serde(flatten)]
    summary: UnloadSummary,
}

/// POST /admin/unload `{"model": "<name>" | "all"}`
async fn unload(
    State(state): State<AppState>,
    Json(req): Json<UnloadRequest>,
) -> Result<Json<UnloadResponse>, ApiError> {
    let name = req
        .model
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("model field is required".into()))?;

    let target = UnloadTarget::parse(&name);
    let summary = state.model_manager().explicit_unload(target.clone()).await?;

    let message = match target {
        UnloadTarget::All => format!(
            "Unloaded {} models ({} busy, {} failed)",
            summary.unloaded.len(),
            summary.busy.len(),
            summary.failed.len()
        ),
        UnloadTarget::Model(_) if summary.unloaded.is_empty() => {
            format!("Model '{name}' was not loaded")
        }
        UnloadTarget::Model(_) => format!("Model '{name}' unloaded"),
    };
    info!(model = %name, unloaded = summary.unloaded.len(), "Admin unload");

    Ok(Json(UnloadResponse {
        status: "success",
        message,
        unloaded_count: summary.unloaded.len(),
        busy_count: summary.busy.len(),
        summary,
    }))
}

#[derive(Serialize)]
struct ReloadResponse {
    status: &'static str,
    #[serde(flatten)]
    summary: ReloadSummary,
}

/// POST /admin/reload: re-scan the models directory. Resident models are left alone.
async fn reload(State(state): State<AppState>) -> Result<Json<ReloadResponse>, ApiError> {
    let summary = state.registry().reload()?;
    state.broadcast_event(
        "registry.reloaded",
        serde_json::to_value(summary).unwrap_or_default(),
    );
    Ok(Json(ReloadResponse {
        status: "success",
        summary,
    }))
}

#[derive(Serialize)]
struct ResidentResponse {
    object: &'static str,
    max_resident: Option<usize>,
    data: Vec<ResidentInfo>,
}

/// GET /api/models/resident
async fn resident(State(state): State<AppState>) -> Json<ResidentResponse> {
    let manager = state.model_manager();
    Json(ResidentResponse {
        object: "list",
        max_resident: manager.max_resident(),
        data: manager.list_resident(),
    })
}
