//! AlgoDesk - rule-based strategy execution and backtesting engine

pub mod api;
pub mod brokers;
pub mod config;
pub mod error;
pub mod services;
pub mod types;

use config::Config;
use services::TradingEngine;
use std::sync::Arc;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<TradingEngine>,
}

pub use types::*;
