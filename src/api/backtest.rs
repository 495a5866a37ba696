//! Backtest API
//!
//! - POST /api/backtests/:strategy_id - Run a backtest
//! - GET /api/backtests/:strategy_id - Previous runs, newest first

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::api::ApiResponse;
use crate::error::Result;
use crate::types::BacktestResult;
use crate::AppState;

const DEFAULT_INITIAL_CAPITAL: f64 = 100_000.0;

fn default_period() -> String {
    "1m".to_string()
}

fn default_capital() -> f64 {
    DEFAULT_INITIAL_CAPITAL
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBacktestRequest {
    #[serde(default = "default_period")]
    pub period: String,
    #[serde(default = "default_capital")]
    pub initial_capital: f64,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/:strategy_id", get(list_results).post(run_backtest))
}

async fn run_backtest(
    State(state): State<AppState>,
    Path(strategy_id): Path<String>,
    Json(request): Json<RunBacktestRequest>,
) -> Result<Json<ApiResponse<BacktestResult>>> {
    let engine = state.engine.clone();
    let result = tokio::task::spawn_blocking(move || {
        engine.run_backtest(&strategy_id, &request.period, request.initial_capital)
    })
    .await
    .map_err(anyhow::Error::from)??;
    Ok(Json(ApiResponse::new(result)))
}

async fn list_results(
    State(state): State<AppState>,
    Path(strategy_id): Path<String>,
) -> Result<Json<ApiResponse<Vec<BacktestResult>>>> {
    Ok(Json(ApiResponse::new(state.engine.backtest_results(&strategy_id)?)))
}
