//! Backtest Simulator
//!
//! Replays one strategy over stored bars with synthetic fills.
//! Features:
//! - Replay window measured back from the latest stored bar
//! - Option legs priced through the pricing model with slippage and costs
//! - Stop-loss, target and profit-trailing exits on the bar extremes
//! - Indicator strategies filled at the close with a flat cost
//! - One equity curve point per replayed bar

use crate::error::{EngineError, EngineResult};
use crate::services::pricing::{self, Liquidity, PricingModel, TransactionCosts, FLAT_COST_RATE, PRICE_FLOOR};
use crate::services::strategy_engine::{
    check_supported, check_underlying, conditions_met, is_trading_moment, required_history,
    resolve_leg, ResolvedLeg,
};
use crate::services::{PerformanceTracker, SqliteStore};
use crate::types::{
    exchange_timestamp_ms, BacktestPeriod, BacktestResult, BacktestTrade, Bar, EntryCondition,
    EquityCurvePoint, ExitReason, InstrumentAllocation, InstrumentKind, OrderLeg, OrderSide, ProfitTrailing,
    Strategy, StrategyKind, TransactionDirection,
};
use chrono::{Duration, NaiveDate, NaiveTime};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Minimum warmup bars loaded ahead of the window for indicator strategies.
const MIN_WARMUP_BARS: usize = 50;

/// An open simulated position.
#[derive(Debug, Clone)]
struct SimulatedPosition {
    symbol: String,
    side: OrderSide,
    quantity: u32,
    strike: Option<f64>,
    entry_price: f64,
    theoretical_price: f64,
    entry_time: i64,
    entry_cost: f64,
    time_to_expiry_days: Option<f64>,
}

impl SimulatedPosition {
    fn signed_quantity(&self) -> i64 {
        match self.side {
            OrderSide::Buy => i64::from(self.quantity),
            OrderSide::Sell => -i64::from(self.quantity),
        }
    }

    /// Per-unit P&L against the entry fill.
    fn unit_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.side.sign()
    }
}

/// Cash and open positions during a replay.
struct SimulatedPortfolio {
    cash: f64,
    positions: HashMap<String, SimulatedPosition>,
    trades: Vec<BacktestTrade>,
    total_costs: f64,
    tracker: PerformanceTracker,
    equity_curve: Vec<EquityCurvePoint>,
}

impl SimulatedPortfolio {
    fn new(initial_capital: f64) -> Self {
        Self {
            cash: initial_capital,
            positions: HashMap::new(),
            trades: Vec::new(),
            total_costs: 0.0,
            tracker: PerformanceTracker::new(initial_capital),
            equity_curve: Vec::new(),
        }
    }

    /// Cash plus open positions marked at `marks` (entry price when unmarked).
    fn equity(&self, marks: &HashMap<String, f64>) -> f64 {
        let open: f64 = self
            .positions
            .iter()
            .map(|(key, pos)| {
                let price = marks.get(key).copied().unwrap_or(pos.entry_price);
                pos.signed_quantity() as f64 * price
            })
            .sum();
        self.cash + open
    }

    fn open_position(&mut self, key: String, position: SimulatedPosition) {
        let notional = position.entry_price * f64::from(position.quantity);
        self.cash -= position.side.sign() * notional + position.entry_cost;
        self.total_costs += position.entry_cost;
        self.positions.insert(key, position);
    }

    fn close_position(
        &mut self,
        key: &str,
        exit_price: f64,
        exit_cost: f64,
        exit_time: i64,
        reason: ExitReason,
    ) -> Option<&BacktestTrade> {
        let position = self.positions.remove(key)?;
        let quantity = f64::from(position.quantity);
        self.cash += position.side.sign() * exit_price * quantity - exit_cost;
        self.total_costs += exit_cost;

        let costs = position.entry_cost + exit_cost;
        let pnl = position.unit_pnl(exit_price) * quantity - costs;
        self.tracker.record_trade(pnl);
        self.trades.push(BacktestTrade {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: position.signed_quantity(),
            strike: position.strike,
            entry_price: position.entry_price,
            theoretical_price: position.theoretical_price,
            exit_price,
            entry_time: position.entry_time,
            exit_time,
            exit_reason: reason,
            time_to_expiry_days: position.time_to_expiry_days,
            costs,
            pnl,
            is_winner: pnl > 0.0,
        });
        self.trades.last()
    }

    fn record_equity(&mut self, date: NaiveDate, marks: &HashMap<String, f64>) {
        let equity = self.equity(marks);
        let point = self.tracker.record_equity(date, equity);
        self.equity_curve.push(point);
    }
}

/// Stop level (per-unit P&L) after trailing, given the best P&L seen.
fn trailed_stop(trailing: ProfitTrailing, base: f64, favourable: f64) -> Option<f64> {
    match trailing {
        ProfitTrailing::None => None,
        ProfitTrailing::LockFixProfit { reach, lock } => (favourable >= reach).then_some(lock),
        ProfitTrailing::TrailProfit { increase, by } => {
            if increase <= 0.0 {
                return None;
            }
            let steps = (favourable / increase).floor();
            (steps >= 1.0).then_some(base + steps * by)
        }
    }
}

fn contract_symbol(underlying: &str, leg: &OrderLeg, strike: Option<f64>) -> String {
    match strike {
        Some(strike) if leg.instrument.is_option() => {
            format!("{} {} {}", underlying, strike, leg.instrument)
        }
        _ if leg.instrument.is_option() => format!("{} {}", underlying, leg.instrument),
        _ => match leg.instrument {
            InstrumentKind::Future => format!("{} FUT", underlying),
            _ => underlying.to_string(),
        },
    }
}

/// Replays strategies and persists the results.
pub struct BacktestSimulator {
    store: Arc<SqliteStore>,
    pricing: PricingModel,
}

impl BacktestSimulator {
    pub fn new(store: Arc<SqliteStore>, pricing: PricingModel) -> Self {
        Self { store, pricing }
    }

    /// Run a backtest and persist its result.
    ///
    /// Nothing is persisted when the run fails.
    pub fn run(
        &self,
        strategy: &Strategy,
        period: BacktestPeriod,
        initial_capital: f64,
    ) -> EngineResult<BacktestResult> {
        if !initial_capital.is_finite() || initial_capital <= 0.0 {
            return Err(EngineError::Validation(
                "initial capital must be positive".to_string(),
            ));
        }
        strategy.validate().map_err(EngineError::Validation)?;

        let primary = match &strategy.kind {
            StrategyKind::TimeBased { underlying, legs } => {
                check_underlying(underlying, legs)?;
                underlying.clone()
            }
            StrategyKind::IndicatorBased {
                instruments,
                conditions,
                ..
            } => {
                check_supported(conditions)?;
                instruments
                    .first()
                    .map(|i| i.symbol.clone())
                    .ok_or_else(|| EngineError::Validation("no instruments".to_string()))?
            }
        };

        let latest = self.store.latest_bar(&primary)?.ok_or_else(|| {
            EngineError::DataUnavailable(format!("no price history for {}", primary))
        })?;
        let (window_start, window_end) = period.window(latest.date());
        let start_ms = exchange_timestamp_ms(window_start, NaiveTime::MIN);
        let end_ms = exchange_timestamp_ms(window_end + Duration::days(1), NaiveTime::MIN) - 1;
        let bars = self.store.bars_in_range(&primary, start_ms, end_ms)?;
        if bars.is_empty() {
            return Err(EngineError::DataUnavailable(format!(
                "no bars for {} between {} and {}",
                primary, window_start, window_end
            )));
        }

        info!(
            "Backtesting strategy {} over {} bars ({} to {})",
            strategy.id,
            bars.len(),
            window_start,
            window_end
        );

        let mut portfolio = SimulatedPortfolio::new(initial_capital);
        let mut warnings = Vec::new();
        match &strategy.kind {
            StrategyKind::TimeBased { underlying, legs } => {
                self.replay_time_based(strategy, underlying, legs, &bars, &mut portfolio, &mut warnings)?
            }
            StrategyKind::IndicatorBased {
                instruments,
                conditions,
                direction,
            } => self.replay_indicator(
                strategy,
                instruments,
                conditions,
                *direction,
                &bars,
                (start_ms, end_ms),
                &mut portfolio,
            )?,
        }

        let final_equity = portfolio
            .equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(initial_capital);
        let run_at = chrono::Utc::now().timestamp_millis();
        let result = BacktestResult {
            id: uuid::Uuid::new_v4().to_string(),
            strategy_id: strategy.id.clone(),
            user_id: strategy.owner_id.clone(),
            period,
            window_start,
            window_end,
            initial_capital,
            final_equity,
            total_return_pct: (final_equity - initial_capital) / initial_capital * 100.0,
            total_costs: portfolio.total_costs,
            metrics: portfolio.tracker.metrics(),
            trades: portfolio.trades,
            equity_curve: portfolio.equity_curve,
            warnings,
            run_at,
        };

        self.store.save_backtest_result(&result)?;
        self.store.set_last_run_at(&strategy.id, run_at)?;
        info!(
            "Backtest {} for strategy {}: {} trades, return {:.2}%",
            result.id,
            strategy.id,
            result.trades.len(),
            result.total_return_pct
        );
        Ok(result)
    }

    // =========================================================================
    // Time-based replay
    // =========================================================================

    fn replay_time_based(
        &self,
        strategy: &Strategy,
        underlying: &str,
        legs: &[OrderLeg],
        bars: &[Bar],
        portfolio: &mut SimulatedPortfolio,
        warnings: &mut Vec<String>,
    ) -> EngineResult<()> {
        let mut retired = vec![false; legs.len()];
        let mut entered_on: Option<NaiveDate> = None;
        let no_marks = HashMap::new();

        for bar in bars {
            let local = bar.local_time().naive_local();
            let date = local.date();
            if !is_trading_moment(strategy, local, bar.is_session_bar()) || entered_on == Some(date) {
                portfolio.record_equity(date, &no_marks);
                continue;
            }
            entered_on = Some(date);

            for (index, leg) in legs.iter().enumerate() {
                if retired[index] {
                    continue;
                }
                let resolved = match resolve_leg(underlying, leg, bar.open, local) {
                    Ok(resolved) => resolved,
                    Err(EngineError::Validation(reason)) => {
                        warn!("Backtest {} skipping {} on {}: {}", strategy.id, leg.describe(), date, reason);
                        warnings.push(format!("{} {}: {}", date, leg.describe(), reason));
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let reason = self.simulate_leg(strategy, underlying, index, leg, resolved, bar, portfolio);
                if matches!(reason, ExitReason::StopLossHit | ExitReason::TargetHit) {
                    debug!("Leg {} of {} retired on {} ({})", index, strategy.id, date, reason);
                    retired[index] = true;
                }
            }
            portfolio.record_equity(date, &no_marks);
        }
        Ok(())
    }

    /// Enter a leg at the bar open and exit it within the same bar.
    #[allow(clippy::too_many_arguments)]
    fn simulate_leg(
        &self,
        strategy: &Strategy,
        underlying: &str,
        index: usize,
        leg: &OrderLeg,
        resolved: ResolvedLeg,
        bar: &Bar,
        portfolio: &mut SimulatedPortfolio,
    ) -> ExitReason {
        let strike = resolved.strike.unwrap_or(bar.open);
        let days = resolved.days_to_expiry.unwrap_or(0.0);
        let quantity = leg.quantity;
        let sign = leg.side.sign();

        let entry = self
            .pricing
            .quote(underlying, leg.instrument, bar.open, strike, days, leg.side, quantity);
        let entry_cost = TransactionCosts::on_notional(entry.fill * f64::from(quantity)).total();
        let key = format!("leg-{}", index);
        portfolio.open_position(
            key.clone(),
            SimulatedPosition {
                symbol: contract_symbol(underlying, leg, resolved.strike),
                side: leg.side,
                quantity,
                strike: resolved.strike,
                entry_price: entry.fill,
                theoretical_price: entry.theoretical,
                entry_time: bar.timestamp,
                entry_cost,
                time_to_expiry_days: resolved.days_to_expiry,
            },
        );

        let mark = |spot: f64| {
            self.pricing
                .quote(underlying, leg.instrument, spot, strike, days, leg.side.opposite(), quantity)
                .market
        };
        let at_high = mark(bar.high);
        let at_low = mark(bar.low);
        let (adverse, favourable) = match leg.side {
            OrderSide::Buy => (at_high.min(at_low), at_high.max(at_low)),
            OrderSide::Sell => (at_high.max(at_low), at_high.min(at_low)),
        };
        let adverse_pnl = (adverse - entry.fill) * sign;
        let favourable_pnl = (favourable - entry.fill) * sign;
        let stop_distance = leg.stop_loss.map(|t| t.distance(entry.fill, leg.side, true));
        let target_distance = leg.take_profit.map(|t| t.distance(entry.fill, leg.side, false));

        let (exit_mark, reason) = if let Some(d) = stop_distance.filter(|d| adverse_pnl <= -d) {
            (entry.fill - d * sign, ExitReason::StopLossHit)
        } else if let Some(d) = target_distance.filter(|d| favourable_pnl >= *d) {
            (entry.fill + d * sign, ExitReason::TargetHit)
        } else {
            let close = mark(bar.close);
            let base = stop_distance.map(|d| -d).unwrap_or(0.0);
            match trailed_stop(leg.trailing, base, favourable_pnl) {
                Some(stop) if (close - entry.fill) * sign <= stop => {
                    (entry.fill + stop * sign, ExitReason::StopLossHit)
                }
                _ => (close, ExitReason::SquareOff),
            }
        };

        let exit_mark = exit_mark.max(PRICE_FLOOR);
        let liquidity = Liquidity::for_underlying(underlying);
        let exit_fill = pricing::apply_slippage(
            exit_mark,
            pricing::slippage(exit_mark, liquidity, quantity),
            leg.side.opposite(),
        );
        let exit_cost = TransactionCosts::on_notional(exit_fill * f64::from(quantity)).total();
        let exit_time = match reason {
            ExitReason::SquareOff => exchange_timestamp_ms(bar.date(), strategy.square_off_time),
            _ => bar.timestamp,
        };
        if let Some(trade) = portfolio.close_position(&key, exit_fill, exit_cost, exit_time, reason) {
            debug!(
                "{} {} entry {:.2} exit {:.2} pnl {:.2} ({})",
                trade.symbol, leg.side, trade.entry_price, trade.exit_price, trade.pnl, reason
            );
        }
        reason
    }

    // =========================================================================
    // Indicator replay
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    fn replay_indicator(
        &self,
        strategy: &Strategy,
        instruments: &[InstrumentAllocation],
        conditions: &[EntryCondition],
        direction: TransactionDirection,
        bars: &[Bar],
        (start_ms, end_ms): (i64, i64),
        portfolio: &mut SimulatedPortfolio,
    ) -> EngineResult<()> {
        let warmup_len = (required_history(conditions) * 3).max(MIN_WARMUP_BARS);
        let primary = bars.first().map(|b| b.symbol.clone()).unwrap_or_default();
        let warmup = self.store.recent_bars(&primary, start_ms - 1, warmup_len)?;
        let mut closes: Vec<f64> = warmup.iter().map(|b| b.close).collect();
        let mut volumes: Vec<f64> = warmup.iter().map(|b| b.volume).collect();

        // Closes of the other instruments keyed by exchange-local date
        let mut series: HashMap<String, HashMap<NaiveDate, f64>> = HashMap::new();
        for allocation in instruments.iter().filter(|a| a.symbol != primary) {
            let other = self.store.bars_in_range(&allocation.symbol, start_ms, end_ms)?;
            if other.is_empty() {
                return Err(EngineError::DataUnavailable(format!(
                    "no bars for {} in the backtest window",
                    allocation.symbol
                )));
            }
            series.insert(
                allocation.symbol.clone(),
                other.iter().map(|b| (b.date(), b.close)).collect(),
            );
        }

        let side = direction.side();
        let mut marks: HashMap<String, f64> = HashMap::new();
        let last_index = bars.len().saturating_sub(1);

        for (i, bar) in bars.iter().enumerate() {
            closes.push(bar.close);
            volumes.push(bar.volume);
            let local = bar.local_time().naive_local();
            let date = local.date();
            marks.insert(primary.clone(), bar.close);
            for (symbol, closes_by_date) in &series {
                if let Some(close) = closes_by_date.get(&date) {
                    marks.insert(symbol.clone(), *close);
                }
            }

            if is_trading_moment(strategy, local, bar.is_session_bar()) {
                let open: Vec<String> = portfolio.positions.keys().cloned().collect();
                for symbol in open {
                    self.close_flat(portfolio, &symbol, &marks, bar.timestamp, ExitReason::EntryConditionMet);
                }

                if i < last_index && conditions_met(conditions, &closes, &volumes)? {
                    for allocation in instruments {
                        let Some(&price) = marks.get(&allocation.symbol) else {
                            debug!("No price for {} on {}, skipping entry", allocation.symbol, date);
                            continue;
                        };
                        let notional = price * f64::from(allocation.quantity);
                        portfolio.open_position(
                            allocation.symbol.clone(),
                            SimulatedPosition {
                                symbol: allocation.symbol.clone(),
                                side,
                                quantity: allocation.quantity,
                                strike: None,
                                entry_price: price,
                                theoretical_price: price,
                                entry_time: bar.timestamp,
                                entry_cost: notional * FLAT_COST_RATE,
                                time_to_expiry_days: None,
                            },
                        );
                    }
                    debug!("Strategy {} entered on {}", strategy.id, date);
                }
            }

            if i == last_index {
                let open: Vec<String> = portfolio.positions.keys().cloned().collect();
                for symbol in open {
                    self.close_flat(portfolio, &symbol, &marks, bar.timestamp, ExitReason::SquareOff);
                }
            }
            portfolio.record_equity(date, &marks);
        }
        Ok(())
    }

    fn close_flat(
        &self,
        portfolio: &mut SimulatedPortfolio,
        symbol: &str,
        marks: &HashMap<String, f64>,
        timestamp: i64,
        reason: ExitReason,
    ) {
        let Some(position) = portfolio.positions.get(symbol) else {
            return;
        };
        let price = marks.get(symbol).copied().unwrap_or(position.entry_price);
        let exit_cost = price * f64::from(position.quantity) * FLAT_COST_RATE;
        portfolio.close_position(symbol, price, exit_cost, timestamp, reason);
    }
}
