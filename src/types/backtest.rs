//! Backtest Types
//!
//! Replay periods, simulated trades, the equity curve, and the metrics the
//! performance tracker derives from them.

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};

use super::OrderSide;

// =============================================================================
// Period
// =============================================================================

/// Replay period measured back from the latest stored bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BacktestPeriod {
    #[serde(rename = "1m")]
    OneMonth,
    #[serde(rename = "3m")]
    ThreeMonths,
    #[serde(rename = "6m")]
    SixMonths,
    #[serde(rename = "1y")]
    OneYear,
}

impl BacktestPeriod {
    /// Parse a period token (`1m`, `3m`, `6m`, `1y`).
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "1m" => Some(BacktestPeriod::OneMonth),
            "3m" => Some(BacktestPeriod::ThreeMonths),
            "6m" => Some(BacktestPeriod::SixMonths),
            "1y" | "12m" => Some(BacktestPeriod::OneYear),
            _ => None,
        }
    }

    pub fn months(&self) -> u32 {
        match self {
            BacktestPeriod::OneMonth => 1,
            BacktestPeriod::ThreeMonths => 3,
            BacktestPeriod::SixMonths => 6,
            BacktestPeriod::OneYear => 12,
        }
    }

    /// Inclusive `(start, end)` window ending at `latest`.
    ///
    /// Calendar months are clamped to the month end, so one month back from
    /// March 31st is the last day of February.
    pub fn window(&self, latest: NaiveDate) -> (NaiveDate, NaiveDate) {
        let start = latest
            .checked_sub_months(Months::new(self.months()))
            .unwrap_or(NaiveDate::MIN);
        (start, latest)
    }
}

impl std::fmt::Display for BacktestPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BacktestPeriod::OneMonth => write!(f, "1m"),
            BacktestPeriod::ThreeMonths => write!(f, "3m"),
            BacktestPeriod::SixMonths => write!(f, "6m"),
            BacktestPeriod::OneYear => write!(f, "1y"),
        }
    }
}

// =============================================================================
// Trades & Equity
// =============================================================================

/// Why a simulated position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    SquareOff,
    StopLossHit,
    TargetHit,
    EntryConditionMet,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::SquareOff => write!(f, "Square-off"),
            ExitReason::StopLossHit => write!(f, "StopLoss hit"),
            ExitReason::TargetHit => write!(f, "Target hit"),
            ExitReason::EntryConditionMet => write!(f, "Entry condition met"),
        }
    }
}

/// A closed simulated trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestTrade {
    pub id: String,
    /// Option contract (e.g. `NIFTY 22000 CE`) or instrument symbol
    pub symbol: String,
    pub side: OrderSide,
    /// Positive for long, negative for short
    pub quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strike: Option<f64>,
    /// Fill price including slippage
    pub entry_price: f64,
    /// Model price before liquidity and slippage adjustments
    pub theoretical_price: f64,
    pub exit_price: f64,
    pub entry_time: i64,
    pub exit_time: i64,
    pub exit_reason: ExitReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_expiry_days: Option<f64>,
    /// Entry plus exit transaction costs
    pub costs: f64,
    /// Realized P&L net of costs and slippage
    pub pnl: f64,
    pub is_winner: bool,
}

/// Equity at the end of one replayed bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityCurvePoint {
    pub date: NaiveDate,
    pub equity: f64,
    pub drawdown_pct: f64,
}

/// Running and derived performance statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub peak_equity: f64,
    pub max_drawdown_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_drawdown_date: Option<NaiveDate>,
    pub current_win_streak: u32,
    pub current_loss_streak: u32,
    pub max_win_streak: u32,
    pub max_loss_streak: u32,
    pub closed_legs: u32,
    pub winning_legs: u32,
    pub losing_legs: u32,
    pub win_rate_pct: f64,
    pub sharpe_ratio: f64,
    pub total_pnl: f64,
}

// =============================================================================
// Result
// =============================================================================

/// One persisted backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub id: String,
    pub strategy_id: String,
    pub user_id: String,
    pub period: BacktestPeriod,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub initial_capital: f64,
    pub final_equity: f64,
    pub total_return_pct: f64,
    pub total_costs: f64,
    pub metrics: PerformanceMetrics,
    pub trades: Vec<BacktestTrade>,
    pub equity_curve: Vec<EquityCurvePoint>,
    /// Legs skipped during replay, with the reason
    #[serde(default)]
    pub warnings: Vec<String>,
    pub run_at: i64,
}
