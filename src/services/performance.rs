//! Performance Tracker
//!
//! Running drawdown, streak and win-rate bookkeeping shared by the backtest
//! simulator and live strategy reporting.

use crate::types::{
    to_exchange_time, EquityCurvePoint, OrderSide, OrderStatus, PerformanceMetrics, TradeRecord,
};
use chrono::NaiveDate;
use std::collections::HashMap;

/// Trading days per year used to annualise the Sharpe ratio.
const TRADING_DAYS: f64 = 252.0;

/// Accumulates closed legs and equity observations.
#[derive(Debug, Clone)]
pub struct PerformanceTracker {
    metrics: PerformanceMetrics,
    last_equity: f64,
    daily_returns: Vec<f64>,
}

impl PerformanceTracker {
    pub fn new(initial_equity: f64) -> Self {
        Self {
            metrics: PerformanceMetrics {
                peak_equity: initial_equity,
                ..Default::default()
            },
            last_equity: initial_equity,
            daily_returns: Vec::new(),
        }
    }

    /// Record one closed leg.
    pub fn record_trade(&mut self, pnl: f64) {
        let m = &mut self.metrics;
        m.closed_legs += 1;
        m.total_pnl += pnl;
        if pnl > 0.0 {
            m.winning_legs += 1;
            m.current_win_streak += 1;
            m.current_loss_streak = 0;
            m.max_win_streak = m.max_win_streak.max(m.current_win_streak);
        } else {
            m.losing_legs += 1;
            m.current_loss_streak += 1;
            m.current_win_streak = 0;
            m.max_loss_streak = m.max_loss_streak.max(m.current_loss_streak);
        }
    }

    /// Record end-of-bar equity and return the curve point for it.
    pub fn record_equity(&mut self, date: NaiveDate, equity: f64) -> EquityCurvePoint {
        if self.last_equity.abs() > f64::EPSILON {
            self.daily_returns
                .push((equity - self.last_equity) / self.last_equity);
        }
        self.last_equity = equity;

        let m = &mut self.metrics;
        if equity > m.peak_equity {
            m.peak_equity = equity;
        }
        let drawdown_pct = if m.peak_equity > 0.0 {
            (m.peak_equity - equity) / m.peak_equity * 100.0
        } else {
            0.0
        };
        if drawdown_pct > m.max_drawdown_pct {
            m.max_drawdown_pct = drawdown_pct;
            m.max_drawdown_date = Some(date);
        }

        EquityCurvePoint {
            date,
            equity,
            drawdown_pct,
        }
    }

    /// Snapshot with win rate and Sharpe ratio derived.
    pub fn metrics(&self) -> PerformanceMetrics {
        let mut metrics = self.metrics.clone();
        metrics.win_rate_pct = if metrics.closed_legs > 0 {
            metrics.winning_legs as f64 / metrics.closed_legs as f64 * 100.0
        } else {
            0.0
        };
        metrics.sharpe_ratio = sharpe_ratio(&self.daily_returns);
        metrics
    }

    /// Replay a live trade ledger, pairing exits with earlier entries per symbol.
    pub fn from_ledger(trades: &[TradeRecord]) -> Self {
        let mut ordered: Vec<&TradeRecord> = trades
            .iter()
            .filter(|t| matches!(t.status, OrderStatus::Filled | OrderStatus::PartiallyFilled))
            .filter(|t| t.price.is_some())
            .collect();
        ordered.sort_by_key(|t| t.created_at);

        let mut tracker = Self::new(0.0);
        let mut open: HashMap<&str, (OrderSide, f64, i64)> = HashMap::new();
        for trade in ordered {
            let price = trade.price.unwrap_or_default();
            if !trade.is_exit {
                open.insert(trade.symbol.as_str(), (trade.side, price, trade.quantity));
                continue;
            }
            let Some((side, entry, quantity)) = open.remove(trade.symbol.as_str()) else {
                continue;
            };
            let pnl = trade
                .realized_pnl
                .unwrap_or_else(|| (price - entry) * side.sign() * quantity as f64);
            tracker.record_trade(pnl);
            let date = to_exchange_time(trade.created_at).date_naive();
            let equity = tracker.metrics.total_pnl;
            tracker.record_cumulative(date, equity);
        }
        tracker
    }

    /// Equity bookkeeping for a ledger that starts from zero capital.
    fn record_cumulative(&mut self, date: NaiveDate, equity: f64) {
        let m = &mut self.metrics;
        if equity > m.peak_equity {
            m.peak_equity = equity;
        }
        let drawdown = m.peak_equity - equity;
        if m.peak_equity > 0.0 && drawdown / m.peak_equity * 100.0 > m.max_drawdown_pct {
            m.max_drawdown_pct = drawdown / m.peak_equity * 100.0;
            m.max_drawdown_date = Some(date);
        }
        self.last_equity = equity;
    }
}

/// Mean daily return over its population standard deviation, annualised.
pub fn sharpe_ratio(daily_returns: &[f64]) -> f64 {
    if daily_returns.is_empty() {
        return 0.0;
    }
    let n = daily_returns.len() as f64;
    let mean = daily_returns.iter().sum::<f64>() / n;
    let std_dev = calculate_std_dev(daily_returns, mean);
    if std_dev > 0.0 {
        mean / std_dev * TRADING_DAYS.sqrt()
    } else {
        0.0
    }
}

fn calculate_std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance: f64 =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}
