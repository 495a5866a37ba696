//! Engine API
//!
//! - GET /api/engine/status - Running flag and counters
//! - POST /api/engine/prices - Feed the live price book

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::ApiResponse;
use crate::error::Result;
use crate::services::EngineStatus;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdateResponse {
    pub accepted: usize,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(engine_status))
        .route("/prices", post(update_prices))
}

async fn engine_status(State(state): State<AppState>) -> Json<ApiResponse<EngineStatus>> {
    Json(ApiResponse::new(state.engine.engine_status()))
}

async fn update_prices(
    State(state): State<AppState>,
    Json(updates): Json<Vec<PriceUpdate>>,
) -> Result<Json<ApiResponse<PriceUpdateResponse>>> {
    for update in &updates {
        state.engine.update_price(&update.symbol, update.price)?;
    }
    Ok(Json(ApiResponse::new(PriceUpdateResponse {
        accepted: updates.len(),
    })))
}
