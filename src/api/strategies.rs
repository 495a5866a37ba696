//! Strategy API
//!
//! Live lifecycle of strategies created by the CRUD layer:
//! - POST /api/strategies/:id/start - Register for live evaluation
//! - POST /api/strategies/:id/stop - Remove from live evaluation
//! - POST /api/strategies/:id/pause - Suspend evaluation
//! - POST /api/strategies/:id/resume - Resume evaluation
//! - GET /api/strategies/active?userId= - A user's running strategies
//! - GET /api/strategies/:id/performance - Metrics from the live trade ledger

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::ApiResponse;
use crate::error::{AppError, Result};
use crate::services::{ActiveStrategyInfo, StartOutcome, StopOutcome};
use crate::types::PerformanceMetrics;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/active", get(active_strategies))
        .route("/:id/start", post(start_strategy))
        .route("/:id/stop", post(stop_strategy))
        .route("/:id/pause", post(pause_strategy))
        .route("/:id/resume", post(resume_strategy))
        .route("/:id/performance", get(strategy_performance))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveQuery {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedResponse {
    pub paused: bool,
}

async fn start_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<StartOutcome>>> {
    let outcome = state.engine.start_strategy(&id)?;
    Ok(Json(ApiResponse::new(outcome)))
}

async fn stop_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<StopOutcome>>> {
    let outcome = state.engine.stop_strategy(&id)?;
    Ok(Json(ApiResponse::new(outcome)))
}

async fn pause_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<PausedResponse>>> {
    state.engine.pause_strategy(&id)?;
    Ok(Json(ApiResponse::new(PausedResponse { paused: true })))
}

async fn resume_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<PausedResponse>>> {
    state.engine.resume_strategy(&id)?;
    Ok(Json(ApiResponse::new(PausedResponse { paused: false })))
}

async fn active_strategies(
    State(state): State<AppState>,
    Query(query): Query<ActiveQuery>,
) -> Result<Json<ApiResponse<Vec<ActiveStrategyInfo>>>> {
    if query.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("userId is required".to_string()));
    }
    Ok(Json(ApiResponse::new(state.engine.active_strategies(&query.user_id))))
}

async fn strategy_performance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<PerformanceMetrics>>> {
    let metrics = state.engine.strategy_performance(&id)?;
    Ok(Json(ApiResponse::new(metrics)))
}
