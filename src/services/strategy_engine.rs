//! Strategy Engine
//!
//! Evaluation logic shared by live scheduling and the backtest simulator:
//! - Indicator values and entry-condition evaluation over bar history
//! - Trading-day and time-window checks
//! - Strike and expiry resolution for option legs
//! - Live evaluation of a registered strategy into queued orders

use crate::error::{EngineError, EngineResult};
use crate::services::pricing::{
    expiry_for, is_valid_strike, monthly_expiry, select_strike, strike_increment,
    time_to_expiry_days,
};
use crate::services::registry::{OpenOrder, RunningStrategy, ScheduleState};
use crate::services::SqliteStore;
use crate::types::{
    ComparisonOperator, EntryCondition, IndicatorType, Instrument, InstrumentKind, OrderLeg,
    OrderSide, OrderSpec, QueuedOrder, Strategy, StrategyKind, TradeContext,
};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Minimum bars fetched for live indicator evaluation.
const MIN_LIVE_HISTORY: usize = 50;

// =============================================================================
// Indicators
// =============================================================================

fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let sum: f64 = prices[prices.len() - period..].iter().sum();
    Some(sum / period as f64)
}

fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = prices[0];
    for price in prices.iter().skip(1) {
        ema = (price - ema) * multiplier + ema;
    }
    Some(ema)
}

fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }
    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in (prices.len() - period)..prices.len() {
        let change = prices[i] - prices[i - 1];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }
    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

/// Value of `indicator` at the end of the series.
///
/// `Ok(None)` means the history is too short.
pub fn indicator_value(
    indicator: IndicatorType,
    period: Option<u32>,
    closes: &[f64],
    volumes: &[f64],
) -> EngineResult<Option<f64>> {
    let value = match indicator {
        IndicatorType::Price => closes.last().copied(),
        IndicatorType::Volume => volumes.last().copied(),
        IndicatorType::Sma => calculate_sma(closes, indicator.period_or_default(period) as usize),
        IndicatorType::Ema => calculate_ema(closes, indicator.period_or_default(period) as usize),
        IndicatorType::Rsi => calculate_rsi(closes, indicator.period_or_default(period) as usize),
        other => {
            return Err(EngineError::Unsupported(format!(
                "indicator '{}' is not implemented",
                other
            )))
        }
    };
    Ok(value)
}

fn comparison_value(
    condition: &EntryCondition,
    closes: &[f64],
    volumes: &[f64],
) -> EngineResult<Option<f64>> {
    match condition.compare_indicator {
        Some(indicator) => indicator_value(indicator, condition.compare_period, closes, volumes),
        None => Ok(Some(condition.value)),
    }
}

/// Evaluate one condition at the end of the series (last element is current).
pub fn evaluate_condition(
    condition: &EntryCondition,
    closes: &[f64],
    volumes: &[f64],
) -> EngineResult<bool> {
    let current = indicator_value(condition.indicator, condition.period, closes, volumes)?;
    let compare = comparison_value(condition, closes, volumes)?;
    let (Some(current), Some(compare)) = (current, compare) else {
        debug!("Not enough history for {}", condition.describe());
        return Ok(false);
    };

    let met = match condition.operator {
        ComparisonOperator::LessThan => current < compare,
        ComparisonOperator::LessThanOrEqual => current <= compare,
        ComparisonOperator::GreaterThan => current > compare,
        ComparisonOperator::GreaterThanOrEqual => current >= compare,
        ComparisonOperator::CrossesAbove | ComparisonOperator::CrossesBelow => {
            if closes.len() < 2 {
                return Ok(false);
            }
            let prev_closes = &closes[..closes.len() - 1];
            let prev_volumes = &volumes[..volumes.len().saturating_sub(1)];
            let prev = indicator_value(condition.indicator, condition.period, prev_closes, prev_volumes)?;
            let prev_compare = comparison_value(condition, prev_closes, prev_volumes)?;
            let (Some(prev), Some(prev_compare)) = (prev, prev_compare) else {
                return Ok(false);
            };
            if condition.operator == ComparisonOperator::CrossesAbove {
                prev <= prev_compare && current > compare
            } else {
                prev >= prev_compare && current < compare
            }
        }
    };
    Ok(met)
}

/// All conditions must hold; an empty list never triggers.
pub fn conditions_met(
    conditions: &[EntryCondition],
    closes: &[f64],
    volumes: &[f64],
) -> EngineResult<bool> {
    if conditions.is_empty() {
        return Ok(false);
    }
    for condition in conditions {
        if !evaluate_condition(condition, closes, volumes)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Fail early on indicators that cannot be evaluated.
pub fn check_supported(conditions: &[EntryCondition]) -> EngineResult<()> {
    for condition in conditions {
        indicator_value(condition.indicator, condition.period, &[], &[])?;
        if let Some(indicator) = condition.compare_indicator {
            indicator_value(indicator, condition.compare_period, &[], &[])?;
        }
    }
    Ok(())
}

/// Bars of history needed to evaluate every condition.
pub fn required_history(conditions: &[EntryCondition]) -> usize {
    conditions
        .iter()
        .map(|c| c.lookback())
        .max()
        .unwrap_or(1)
}

// =============================================================================
// Windows & Legs
// =============================================================================

/// Whether a strategy may act at exchange-local `at`.
///
/// Session bars (stamped at midnight) only need the trading-day check.
pub fn is_trading_moment(strategy: &Strategy, at: NaiveDateTime, session_bar: bool) -> bool {
    strategy.trades_on(at.weekday()) && (session_bar || strategy.in_window(at.time()))
}

/// Strike and expiry for one leg at a moment in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedLeg {
    pub strike: Option<f64>,
    pub expiry: Option<NaiveDate>,
    pub days_to_expiry: Option<f64>,
}

/// Reject option legs on underlyings without a known strike increment.
pub fn check_underlying(underlying: &str, legs: &[OrderLeg]) -> EngineResult<()> {
    if legs.iter().any(|l| l.instrument.is_option()) && strike_increment(underlying).is_none() {
        return Err(EngineError::Validation(format!(
            "unknown underlying '{}' for option legs",
            underlying
        )));
    }
    Ok(())
}

/// Resolve strike, expiry and time-to-expiry for a leg.
///
/// Option legs with less than one day to expiry are rejected.
pub fn resolve_leg(
    underlying: &str,
    leg: &OrderLeg,
    spot: f64,
    at: NaiveDateTime,
) -> EngineResult<ResolvedLeg> {
    match leg.instrument {
        InstrumentKind::Call | InstrumentKind::Put => {
            let increment = strike_increment(underlying).ok_or_else(|| {
                EngineError::Validation(format!("unknown underlying '{}'", underlying))
            })?;
            let strike = select_strike(spot, increment, leg.instrument, leg.strike_selection);
            if !is_valid_strike(strike, increment) {
                return Err(EngineError::Validation(format!(
                    "strike {} is not a multiple of {}",
                    strike, increment
                )));
            }
            let expiry = expiry_for(leg.expiry, at);
            let days = time_to_expiry_days(at, expiry);
            if days < 1.0 {
                return Err(EngineError::Validation(format!(
                    "{:.2} days to {} expiry is under one day",
                    days, expiry
                )));
            }
            Ok(ResolvedLeg {
                strike: Some(strike),
                expiry: Some(expiry),
                days_to_expiry: Some(days),
            })
        }
        InstrumentKind::Future => {
            let expiry = monthly_expiry(at);
            Ok(ResolvedLeg {
                strike: None,
                expiry: Some(expiry),
                days_to_expiry: Some(time_to_expiry_days(at, expiry)),
            })
        }
        InstrumentKind::Equity => Ok(ResolvedLeg {
            strike: None,
            expiry: None,
            days_to_expiry: None,
        }),
    }
}

/// Strategy context recorded on an entry order for a leg.
pub fn leg_context(leg: &OrderLeg, reference_price: f64) -> TradeContext {
    TradeContext {
        entry_condition: leg.describe(),
        exit_condition: None,
        stop_loss: leg.stop_loss.map(|t| t.to_string()),
        target: leg.take_profit.map(|t| t.to_string()),
        reference_price: Some(reference_price),
        is_exit: false,
    }
}

// =============================================================================
// Live Evaluation
// =============================================================================

/// Result of one live evaluation.
#[derive(Debug)]
pub struct Evaluation {
    pub orders: Vec<QueuedOrder>,
    pub state: ScheduleState,
}

/// Evaluates registered strategies against stored bars and the live price book.
pub struct StrategyEngine {
    store: Arc<SqliteStore>,
    /// Latest traded price per symbol
    prices: DashMap<String, f64>,
}

impl StrategyEngine {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            prices: DashMap::new(),
        }
    }

    pub fn update_price(&self, symbol: &str, price: f64) {
        self.prices.insert(symbol.to_ascii_uppercase(), price);
    }

    /// Price book first, then the latest stored bar.
    pub fn latest_price(&self, symbol: &str) -> EngineResult<Option<f64>> {
        if let Some(price) = self.prices.get(&symbol.to_ascii_uppercase()) {
            return Ok(Some(*price));
        }
        Ok(self.store.latest_bar(symbol)?.map(|bar| bar.close))
    }

    /// Evaluate one strategy at exchange-local `now`.
    pub fn evaluate(
        &self,
        running: &RunningStrategy,
        now: DateTime<FixedOffset>,
    ) -> EngineResult<Evaluation> {
        let strategy = &running.strategy;
        let mut state = running.state.clone();
        state.last_run = Some(now.timestamp_millis());
        let local = now.naive_local();
        let today = local.date();

        if !strategy.trades_on(local.weekday()) {
            return Ok(Evaluation { orders: Vec::new(), state });
        }

        if local.time() >= strategy.square_off_time {
            let orders = if state.holds_position(today) {
                self.square_off(strategy, &mut state, today, local)
            } else {
                Vec::new()
            };
            return Ok(Evaluation { orders, state });
        }

        if !strategy.in_window(local.time()) || state.entered_on == Some(today) {
            return Ok(Evaluation { orders: Vec::new(), state });
        }

        let entries = match &strategy.kind {
            StrategyKind::TimeBased { underlying, legs } => {
                self.time_based_entries(strategy, underlying, legs, local)?
            }
            StrategyKind::IndicatorBased {
                instruments,
                conditions,
                direction,
            } => {
                let primary = instruments
                    .first()
                    .ok_or_else(|| EngineError::Validation("no instruments".to_string()))?;
                if !self.live_conditions_met(&primary.symbol, conditions, now.timestamp_millis())? {
                    debug!("Strategy {} conditions not met", strategy.id);
                    return Ok(Evaluation { orders: Vec::new(), state });
                }
                let description = conditions
                    .iter()
                    .map(|c| c.describe())
                    .collect::<Vec<_>>()
                    .join(" AND ");
                let mut entries = Vec::with_capacity(instruments.len());
                for allocation in instruments {
                    let instrument = self.store.find_by_symbol(&allocation.symbol)?.ok_or_else(|| {
                        EngineError::NotFound(format!("instrument {}", allocation.symbol))
                    })?;
                    let spec = market_spec(&instrument, direction.side(), allocation.quantity);
                    let context = TradeContext {
                        entry_condition: description.clone(),
                        reference_price: self.latest_price(&allocation.symbol)?,
                        ..Default::default()
                    };
                    entries.push(OpenOrder { spec, context });
                }
                entries
            }
        };

        state.entered_on = Some(today);
        state.open_orders = entries.clone();
        let orders = entries
            .into_iter()
            .map(|open| {
                QueuedOrder::new(strategy.owner_id.clone(), strategy.id.clone(), open.spec, open.context)
            })
            .collect::<Vec<_>>();
        info!("Strategy {} entered with {} orders", strategy.id, orders.len());
        Ok(Evaluation { orders, state })
    }

    fn time_based_entries(
        &self,
        strategy: &Strategy,
        underlying: &str,
        legs: &[OrderLeg],
        at: NaiveDateTime,
    ) -> EngineResult<Vec<OpenOrder>> {
        check_underlying(underlying, legs)?;
        let spot = self.latest_price(underlying)?.ok_or_else(|| {
            EngineError::DataUnavailable(format!("no price for {}", underlying))
        })?;

        let mut entries = Vec::with_capacity(legs.len());
        for leg in legs {
            let resolved = match resolve_leg(underlying, leg, spot, at) {
                Ok(resolved) => resolved,
                Err(EngineError::Validation(reason)) => {
                    warn!("Strategy {} skipping leg {}: {}", strategy.id, leg.describe(), reason);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let instrument = self
                .store
                .find_contract(underlying, leg.instrument, resolved.strike, resolved.expiry)?
                .ok_or_else(|| {
                    EngineError::NotFound(format!(
                        "{} {} contract strike {:?} expiry {:?}",
                        underlying, leg.instrument, resolved.strike, resolved.expiry
                    ))
                })?;
            entries.push(OpenOrder {
                spec: market_spec(&instrument, leg.side, leg.quantity),
                context: leg_context(leg, spot),
            });
        }
        Ok(entries)
    }

    fn live_conditions_met(
        &self,
        symbol: &str,
        conditions: &[EntryCondition],
        now_ms: i64,
    ) -> EngineResult<bool> {
        check_supported(conditions)?;
        let needed = (required_history(conditions) * 3).max(MIN_LIVE_HISTORY);
        let bars = self.store.recent_bars(symbol, now_ms, needed)?;
        let mut closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let mut volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
        if let Some(price) = self.prices.get(&symbol.to_ascii_uppercase()) {
            closes.push(*price);
            volumes.push(volumes.last().copied().unwrap_or_default());
        }
        if closes.is_empty() {
            return Err(EngineError::DataUnavailable(format!("no bars for {}", symbol)));
        }
        conditions_met(conditions, &closes, &volumes)
    }

    fn square_off(
        &self,
        strategy: &Strategy,
        state: &mut ScheduleState,
        today: NaiveDate,
        at: NaiveDateTime,
    ) -> Vec<QueuedOrder> {
        let exit_condition = format!("Square-off at {}", at.format("%H:%M"));
        let orders = state
            .open_orders
            .drain(..)
            .map(|open| {
                let mut spec = open.spec;
                spec.transaction_type = spec.transaction_type.map(|side| side.opposite());
                spec.correlation_id = None;
                let context = TradeContext {
                    exit_condition: Some(exit_condition.clone()),
                    is_exit: true,
                    ..open.context
                };
                QueuedOrder::new(strategy.owner_id.clone(), strategy.id.clone(), spec, context)
            })
            .collect::<Vec<_>>();
        state.squared_off_on = Some(today);
        info!("Strategy {} squared off {} orders", strategy.id, orders.len());
        orders
    }
}

fn market_spec(instrument: &Instrument, side: OrderSide, quantity: u32) -> OrderSpec {
    OrderSpec::market(
        side,
        instrument.exchange_segment,
        instrument.security_id.clone(),
        instrument.trading_symbol.clone(),
        i64::from(quantity),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BrokerKind, StrikeSelection};
    use chrono::{NaiveTime, Weekday};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_sma_condition() {
        let condition = EntryCondition::price_vs_sma(ComparisonOperator::GreaterThan, 3);
        let closes = [10.0, 11.0, 12.0, 15.0];
        assert!(evaluate_condition(&condition, &closes, &[]).unwrap());

        let falling = [15.0, 12.0, 11.0, 10.0];
        assert!(!evaluate_condition(&condition, &falling, &[]).unwrap());

        // Too short for the SMA
        assert!(!evaluate_condition(&condition, &[10.0, 11.0], &[]).unwrap());
    }

    #[test]
    fn test_crosses_above() {
        let condition = EntryCondition::new(IndicatorType::Price, ComparisonOperator::CrossesAbove, 100.0);
        assert!(evaluate_condition(&condition, &[99.0, 101.0], &[]).unwrap());
        assert!(!evaluate_condition(&condition, &[101.0, 102.0], &[]).unwrap());
        assert!(!evaluate_condition(&condition, &[101.0], &[]).unwrap());
    }

    #[test]
    fn test_rsi_threshold() {
        let condition = EntryCondition::new(IndicatorType::Rsi, ComparisonOperator::LessThan, 30.0)
            .with_period(3);
        let falling = [100.0, 98.0, 95.0, 90.0];
        assert!(evaluate_condition(&condition, &falling, &[]).unwrap());
    }

    #[test]
    fn test_unimplemented_indicator_is_unsupported() {
        let condition = EntryCondition::new(IndicatorType::Macd, ComparisonOperator::GreaterThan, 0.0);
        let err = evaluate_condition(&condition, &[1.0, 2.0], &[]).unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
        assert!(check_supported(&[condition]).is_err());
        assert!(check_supported(&[EntryCondition::price_vs_sma(ComparisonOperator::LessThan, 5)]).is_ok());
    }

    #[test]
    fn test_empty_conditions_never_trigger() {
        assert!(!conditions_met(&[], &[1.0], &[]).unwrap());
    }

    #[test]
    fn test_trading_moment() {
        let strategy = Strategy::new(
            "u".to_string(),
            "s".to_string(),
            BrokerKind::Dhan,
            StrategyKind::TimeBased {
                underlying: "NIFTY".to_string(),
                legs: vec![OrderLeg::option(OrderSide::Buy, InstrumentKind::Call, 50)],
            },
        )
        .with_window(
            NaiveTime::from_hms_opt(9, 20, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 15, 0).unwrap(),
        )
        .with_trading_days(vec![Weekday::Mon, Weekday::Wed]);

        assert!(is_trading_moment(&strategy, at(2024, 3, 11, 10, 0), false));
        assert!(!is_trading_moment(&strategy, at(2024, 3, 11, 9, 0), false));
        assert!(is_trading_moment(&strategy, at(2024, 3, 11, 0, 0), true));
        assert!(!is_trading_moment(&strategy, at(2024, 3, 12, 10, 0), false));
    }

    #[test]
    fn test_resolve_leg() {
        let leg = OrderLeg::option(OrderSide::Buy, InstrumentKind::Put, 50)
            .with_strike(StrikeSelection::Otm(100));
        let resolved = resolve_leg("NIFTY", &leg, 22_013.0, at(2024, 3, 11, 9, 30)).unwrap();
        assert_eq!(resolved.strike, Some(21_900.0));
        assert_eq!(resolved.expiry, NaiveDate::from_ymd_opt(2024, 3, 14));
        assert!(resolved.days_to_expiry.unwrap() > 3.0);

        // Thursday morning: same-day expiry is under one day
        let err = resolve_leg("NIFTY", &leg, 22_013.0, at(2024, 3, 14, 9, 30)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // Off-grid offsets fail the strike check
        let odd = leg.clone().with_strike(StrikeSelection::Itm(30));
        assert!(resolve_leg("NIFTY", &odd, 22_013.0, at(2024, 3, 11, 9, 30)).is_err());

        assert!(check_underlying("UNKNOWN", &[leg]).is_err());
    }
}
