//! Order API
//!
//! - GET /api/orders?userId=&limit= - A user's submission attempts, newest first
//! - POST /api/orders/:id/requeue - Retry a failed submission

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::api::ApiResponse;
use crate::error::{AppError, Result};
use crate::types::{OrderRecord, QueuedOrder};
use crate::AppState;

const MAX_ORDERS: usize = 500;

fn default_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrdersQuery {
    pub user_id: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_orders))
        .route("/:id/requeue", post(requeue_order))
}

async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<OrdersQuery>,
) -> Result<Json<ApiResponse<Vec<OrderRecord>>>> {
    if query.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("userId is required".to_string()));
    }
    let orders = state
        .engine
        .orders_for_user(&query.user_id, query.limit.clamp(1, MAX_ORDERS))?;
    Ok(Json(ApiResponse::new(orders)))
}

async fn requeue_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<QueuedOrder>>> {
    Ok(Json(ApiResponse::new(state.engine.requeue_order(&id)?)))
}
