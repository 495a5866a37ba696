pub mod backtest;
pub mod engine;
pub mod health;
pub mod orders;
pub mod strategies;

use crate::AppState;
use axum::Router;
use serde::Serialize;

/// Envelope for successful responses.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

/// Create the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/api/engine", engine::router())
        .nest("/api/strategies", strategies::router())
        .nest("/api/backtests", backtest::router())
        .nest("/api/orders", orders::router())
}
