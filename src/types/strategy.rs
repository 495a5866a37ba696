//! Strategy Types
//!
//! Strategy definitions as persisted by the CRUD layer: time-based option-leg
//! strategies and indicator-driven multi-instrument strategies.

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use super::{BrokerKind, OrderSide};

// =============================================================================
// Enums
// =============================================================================

/// Strategy lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    /// Created but never started
    Draft,
    /// Registered with the scheduler
    Active,
    /// Registered but evaluation suspended
    Paused,
    /// Removed from the scheduler
    Stopped,
    /// Finished; cannot be restarted
    Completed,
    /// Last action was a backtest run
    Backtested,
}

impl Default for StrategyStatus {
    fn default() -> Self {
        StrategyStatus::Draft
    }
}

impl StrategyStatus {
    /// Whether `start` may move this status to `Active`.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            StrategyStatus::Draft
                | StrategyStatus::Stopped
                | StrategyStatus::Backtested
                | StrategyStatus::Active
        )
    }

    /// Parse the persisted representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(StrategyStatus::Draft),
            "active" => Some(StrategyStatus::Active),
            "paused" => Some(StrategyStatus::Paused),
            "stopped" => Some(StrategyStatus::Stopped),
            "completed" => Some(StrategyStatus::Completed),
            "backtested" => Some(StrategyStatus::Backtested),
            _ => None,
        }
    }
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyStatus::Draft => write!(f, "draft"),
            StrategyStatus::Active => write!(f, "active"),
            StrategyStatus::Paused => write!(f, "paused"),
            StrategyStatus::Stopped => write!(f, "stopped"),
            StrategyStatus::Completed => write!(f, "completed"),
            StrategyStatus::Backtested => write!(f, "backtested"),
        }
    }
}

/// Instrument traded by an order leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// Call option (CE)
    Call,
    /// Put option (PE)
    Put,
    Future,
    Equity,
}

impl InstrumentKind {
    pub fn is_option(&self) -> bool {
        matches!(self, InstrumentKind::Call | InstrumentKind::Put)
    }

    /// Exchange suffix used in option trading symbols.
    pub fn suffix(&self) -> &'static str {
        match self {
            InstrumentKind::Call => "CE",
            InstrumentKind::Put => "PE",
            InstrumentKind::Future => "FUT",
            InstrumentKind::Equity => "EQ",
        }
    }
}

impl std::fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// Expiry class for derivative legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryClass {
    Weekly,
    Monthly,
    Quarterly,
}

impl Default for ExpiryClass {
    fn default() -> Self {
        ExpiryClass::Weekly
    }
}

/// Price the strike is referenced against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrikeReference {
    Spot,
    Futures,
}

impl Default for StrikeReference {
    fn default() -> Self {
        StrikeReference::Spot
    }
}

/// Strike selection relative to the at-the-money strike.
///
/// ITM/OTM offsets are expressed in index points, not in strike steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "points", rename_all = "snake_case")]
pub enum StrikeSelection {
    Atm,
    Itm(u32),
    Otm(u32),
}

impl Default for StrikeSelection {
    fn default() -> Self {
        StrikeSelection::Atm
    }
}

impl std::fmt::Display for StrikeSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrikeSelection::Atm => write!(f, "ATM"),
            StrikeSelection::Itm(n) => write!(f, "ITM {}", n),
            StrikeSelection::Otm(n) => write!(f, "OTM {}", n),
        }
    }
}

/// Unit a stop-loss or take-profit value is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdUnit {
    /// Absolute option price level
    Price,
    /// Percentage of the entry price
    Percentage,
    /// Per-unit price move from entry
    Points,
}

/// A stop-loss or take-profit threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Threshold {
    pub value: f64,
    pub unit: ThresholdUnit,
}

impl Threshold {
    pub fn points(value: f64) -> Self {
        Self { value, unit: ThresholdUnit::Points }
    }

    pub fn percentage(value: f64) -> Self {
        Self { value, unit: ThresholdUnit::Percentage }
    }

    pub fn price(value: f64) -> Self {
        Self { value, unit: ThresholdUnit::Price }
    }

    /// Per-unit P&L distance from `entry` this threshold represents.
    ///
    /// `Price` thresholds are levels on the option premium, so the distance
    /// depends on which side the leg is on.
    pub fn distance(&self, entry: f64, side: OrderSide, is_loss: bool) -> f64 {
        match self.unit {
            ThresholdUnit::Points => self.value,
            ThresholdUnit::Percentage => entry * self.value / 100.0,
            ThresholdUnit::Price => {
                let favourable = match side {
                    OrderSide::Buy => self.value - entry,
                    OrderSide::Sell => entry - self.value,
                };
                if is_loss {
                    -favourable
                } else {
                    favourable
                }
            }
        }
    }
}

impl std::fmt::Display for Threshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.unit {
            ThresholdUnit::Price => write!(f, "@{}", self.value),
            ThresholdUnit::Percentage => write!(f, "{}%", self.value),
            ThresholdUnit::Points => write!(f, "{} pts", self.value),
        }
    }
}

/// Profit-trailing policy for a leg.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProfitTrailing {
    None,
    /// Once profit reaches `reach` points, protect `lock` points.
    LockFixProfit { reach: f64, lock: f64 },
    /// For every `increase` points of profit, move the stop up by `by` points.
    TrailProfit { increase: f64, by: f64 },
}

impl Default for ProfitTrailing {
    fn default() -> Self {
        ProfitTrailing::None
    }
}

/// Direction of trades opened by an indicator strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionDirection {
    Buy,
    Sell,
}

impl TransactionDirection {
    pub fn side(&self) -> OrderSide {
        match self {
            TransactionDirection::Buy => OrderSide::Buy,
            TransactionDirection::Sell => OrderSide::Sell,
        }
    }
}

/// Indicator types supported in entry conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorType {
    Price,
    Sma,
    Ema,
    Rsi,
    Volume,
    Macd,
    Bollinger,
    Supertrend,
    Vwap,
}

impl IndicatorType {
    /// Period used when a condition leaves it unset.
    pub fn default_period(&self) -> Option<u32> {
        match self {
            IndicatorType::Sma | IndicatorType::Ema => Some(20),
            IndicatorType::Rsi => Some(14),
            _ => None,
        }
    }

    /// `period`, falling back to this indicator's default.
    pub fn period_or_default(&self, period: Option<u32>) -> u32 {
        period.or_else(|| self.default_period()).unwrap_or(1)
    }
}

impl std::fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndicatorType::Price => write!(f, "price"),
            IndicatorType::Sma => write!(f, "sma"),
            IndicatorType::Ema => write!(f, "ema"),
            IndicatorType::Rsi => write!(f, "rsi"),
            IndicatorType::Volume => write!(f, "volume"),
            IndicatorType::Macd => write!(f, "macd"),
            IndicatorType::Bollinger => write!(f, "bollinger"),
            IndicatorType::Supertrend => write!(f, "supertrend"),
            IndicatorType::Vwap => write!(f, "vwap"),
        }
    }
}

/// Comparison operators for entry conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    CrossesAbove,
    CrossesBelow,
}

impl std::fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComparisonOperator::LessThan => write!(f, "<"),
            ComparisonOperator::LessThanOrEqual => write!(f, "<="),
            ComparisonOperator::GreaterThan => write!(f, ">"),
            ComparisonOperator::GreaterThanOrEqual => write!(f, ">="),
            ComparisonOperator::CrossesAbove => write!(f, "crosses above"),
            ComparisonOperator::CrossesBelow => write!(f, "crosses below"),
        }
    }
}

// =============================================================================
// Strategy Components
// =============================================================================

/// One buy/sell component of a time-based strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLeg {
    pub side: OrderSide,
    pub quantity: u32,
    pub instrument: InstrumentKind,
    #[serde(default)]
    pub expiry: ExpiryClass,
    #[serde(default)]
    pub strike_reference: StrikeReference,
    #[serde(default)]
    pub strike_selection: StrikeSelection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Threshold>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Threshold>,
    #[serde(default)]
    pub trailing: ProfitTrailing,
}

impl OrderLeg {
    /// Create an ATM weekly option leg.
    pub fn option(side: OrderSide, instrument: InstrumentKind, quantity: u32) -> Self {
        Self {
            side,
            quantity,
            instrument,
            expiry: ExpiryClass::Weekly,
            strike_reference: StrikeReference::Spot,
            strike_selection: StrikeSelection::Atm,
            stop_loss: None,
            take_profit: None,
            trailing: ProfitTrailing::None,
        }
    }

    pub fn with_strike(mut self, selection: StrikeSelection) -> Self {
        self.strike_selection = selection;
        self
    }

    pub fn with_expiry(mut self, expiry: ExpiryClass) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_stop_loss(mut self, threshold: Threshold) -> Self {
        self.stop_loss = Some(threshold);
        self
    }

    pub fn with_take_profit(mut self, threshold: Threshold) -> Self {
        self.take_profit = Some(threshold);
        self
    }

    pub fn with_trailing(mut self, trailing: ProfitTrailing) -> Self {
        self.trailing = trailing;
        self
    }

    /// Short description used on trade records, e.g. `BUY CE ATM x50`.
    pub fn describe(&self) -> String {
        format!(
            "{} {} {} x{}",
            self.side.to_string().to_uppercase(),
            self.instrument,
            self.strike_selection,
            self.quantity
        )
    }
}

/// An entry condition evaluated against bar history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryCondition {
    pub indicator: IndicatorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u32>,
    pub operator: ComparisonOperator,
    /// Fixed value to compare against when no compare indicator is set
    #[serde(default)]
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compare_indicator: Option<IndicatorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compare_period: Option<u32>,
}

impl EntryCondition {
    /// Create a simple condition (indicator op value).
    pub fn new(indicator: IndicatorType, operator: ComparisonOperator, value: f64) -> Self {
        Self {
            indicator,
            period: None,
            operator,
            value,
            compare_indicator: None,
            compare_period: None,
        }
    }

    /// Price compared against an N-period simple moving average.
    pub fn price_vs_sma(operator: ComparisonOperator, period: u32) -> Self {
        Self::new(IndicatorType::Price, operator, 0.0).compared_to(IndicatorType::Sma, Some(period))
    }

    pub fn with_period(mut self, period: u32) -> Self {
        self.period = Some(period);
        self
    }

    pub fn compared_to(mut self, indicator: IndicatorType, period: Option<u32>) -> Self {
        self.compare_indicator = Some(indicator);
        self.compare_period = period;
        self
    }

    /// Longest lookback any side of this condition needs.
    pub fn lookback(&self) -> usize {
        let own = self.indicator.period_or_default(self.period) as usize;
        let other = self
            .compare_indicator
            .map(|indicator| indicator.period_or_default(self.compare_period))
            .unwrap_or(1) as usize;
        own.max(other) + 1
    }

    /// Human readable form recorded on trades.
    pub fn describe(&self) -> String {
        let lhs = match self.period {
            Some(p) => format!("{}({})", self.indicator, p),
            None => self.indicator.to_string(),
        };
        let rhs = match (self.compare_indicator, self.compare_period) {
            (Some(ind), Some(p)) => format!("{}({})", ind, p),
            (Some(ind), None) => ind.to_string(),
            (None, _) => self.value.to_string(),
        };
        format!("{} {} {}", lhs, self.operator, rhs)
    }
}

/// Quantity allocated to one instrument of an indicator strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentAllocation {
    pub symbol: String,
    pub quantity: u32,
}

/// What a strategy trades and how it decides to trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyKind {
    TimeBased {
        underlying: String,
        legs: Vec<OrderLeg>,
    },
    IndicatorBased {
        instruments: Vec<InstrumentAllocation>,
        conditions: Vec<EntryCondition>,
        direction: TransactionDirection,
    },
}

impl StrategyKind {
    /// Symbols whose bars drive this strategy; the first is the primary series.
    pub fn symbols(&self) -> Vec<String> {
        match self {
            StrategyKind::TimeBased { underlying, .. } => vec![underlying.clone()],
            StrategyKind::IndicatorBased { instruments, .. } => {
                instruments.iter().map(|i| i.symbol.clone()).collect()
            }
        }
    }
}

// =============================================================================
// Strategy
// =============================================================================

fn default_start_time() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 20, 0).unwrap_or_default()
}

fn default_square_off_time() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 15, 0).unwrap_or_default()
}

fn default_trading_days() -> Vec<Weekday> {
    vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]
}

/// A user-defined automated strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub broker: BrokerKind,
    pub kind: StrategyKind,
    /// Exchange-local time the trading window opens
    #[serde(default = "default_start_time")]
    pub start_time: NaiveTime,
    /// Exchange-local time open positions are squared off
    #[serde(default = "default_square_off_time")]
    pub square_off_time: NaiveTime,
    #[serde(default = "default_trading_days")]
    pub trading_days: Vec<Weekday>,
    #[serde(default)]
    pub status: StrategyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Strategy {
    /// Create a new draft strategy with the default window (09:20–15:15, Mon–Fri).
    pub fn new(owner_id: String, name: String, broker: BrokerKind, kind: StrategyKind) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id,
            name,
            broker,
            kind,
            start_time: default_start_time(),
            square_off_time: default_square_off_time(),
            trading_days: default_trading_days(),
            status: StrategyStatus::Draft,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_window(mut self, start_time: NaiveTime, square_off_time: NaiveTime) -> Self {
        self.start_time = start_time;
        self.square_off_time = square_off_time;
        self
    }

    pub fn with_trading_days(mut self, days: Vec<Weekday>) -> Self {
        self.trading_days = days;
        self
    }

    pub fn trades_on(&self, day: Weekday) -> bool {
        self.trading_days.contains(&day)
    }

    /// Whether `time` falls inside `[start_time, square_off_time]`.
    pub fn in_window(&self, time: NaiveTime) -> bool {
        time >= self.start_time && time <= self.square_off_time
    }

    /// Structural checks the engine relies on before any state mutation.
    pub fn validate(&self) -> Result<(), String> {
        if self.start_time >= self.square_off_time {
            return Err("start time must be before square-off time".to_string());
        }
        match &self.kind {
            StrategyKind::TimeBased { underlying, legs } => {
                if underlying.trim().is_empty() {
                    return Err("time-based strategy has no underlying".to_string());
                }
                if legs.is_empty() {
                    return Err("time-based strategy has no legs".to_string());
                }
                if legs.iter().any(|l| l.quantity == 0) {
                    return Err("leg quantity must be positive".to_string());
                }
            }
            StrategyKind::IndicatorBased { instruments, conditions, .. } => {
                if instruments.is_empty() {
                    return Err("indicator strategy has no instruments".to_string());
                }
                if conditions.is_empty() {
                    return Err("indicator strategy has no entry conditions".to_string());
                }
                if instruments.iter().any(|i| i.quantity == 0) {
                    return Err("instrument quantity must be positive".to_string());
                }
            }
        }
        Ok(())
    }
}
