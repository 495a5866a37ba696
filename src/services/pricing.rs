//! Pricing Model
//!
//! Deterministic option pricing used by both the live strike/expiry
//! resolution and the backtest simulator:
//! - Strike increments and ATM/ITM/OTM strike selection
//! - Weekly, monthly and quarterly expiry rules
//! - Intrinsic + moneyness-scaled time value pricing
//! - Liquidity adjustment, slippage and transaction costs

use crate::types::{ExpiryClass, InstrumentKind, OrderSide, StrikeSelection};
use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, Weekday};

/// Exchange close cutoff used by the expiry rules (15:30 local).
pub const EXPIRY_CUTOFF: (u32, u32) = (15, 30);

/// Minimum theoretical option price.
pub const PRICE_FLOOR: f64 = 0.1;

/// Flat cost rate applied to indicator-strategy fills.
pub const FLAT_COST_RATE: f64 = 0.001;

const DAYS_PER_YEAR: f64 = 365.0;

fn expiry_cutoff() -> NaiveTime {
    NaiveTime::from_hms_opt(EXPIRY_CUTOFF.0, EXPIRY_CUTOFF.1, 0).unwrap_or(NaiveTime::MIN)
}

// =============================================================================
// Strikes
// =============================================================================

/// Strike spacing for an index underlying.
pub fn strike_increment(underlying: &str) -> Option<f64> {
    match underlying.trim().to_ascii_uppercase().as_str() {
        "NIFTY" | "FINNIFTY" => Some(50.0),
        "MIDCPNIFTY" => Some(25.0),
        "BANKNIFTY" | "SENSEX" | "BANKEX" => Some(100.0),
        _ => None,
    }
}

/// Round the underlying price to the nearest strike.
pub fn atm_strike(underlying_price: f64, increment: f64) -> f64 {
    (underlying_price / increment).round() * increment
}

/// Strike for a leg's selection; offsets are in index points.
pub fn select_strike(
    underlying_price: f64,
    increment: f64,
    kind: InstrumentKind,
    selection: StrikeSelection,
) -> f64 {
    let atm = atm_strike(underlying_price, increment);
    let offset = match selection {
        StrikeSelection::Atm => return atm,
        StrikeSelection::Itm(n) => -(n as f64),
        StrikeSelection::Otm(n) => n as f64,
    };
    match kind {
        InstrumentKind::Put => atm - offset,
        _ => atm + offset,
    }
}

/// Whether `strike` is a positive multiple of `increment`.
pub fn is_valid_strike(strike: f64, increment: f64) -> bool {
    strike > 0.0 && increment > 0.0 && (strike % increment).abs() < 1e-9
}

// =============================================================================
// Expiry
// =============================================================================

fn last_thursday(year: i32, month: u32) -> NaiveDate {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    let mut day = first_of_next
        .and_then(|d| d.pred_opt())
        .unwrap_or(NaiveDate::MIN);
    while day.weekday() != Weekday::Thu {
        day = day.pred_opt().unwrap_or(NaiveDate::MIN);
    }
    day
}

fn is_past(expiry: NaiveDate, at: NaiveDateTime) -> bool {
    at.date() > expiry || (at.date() == expiry && at.time() >= expiry_cutoff())
}

/// Next weekly (Thursday) expiry as seen at exchange-local `at`.
pub fn weekly_expiry(at: NaiveDateTime) -> NaiveDate {
    let date = at.date();
    let ahead = (Weekday::Thu.num_days_from_monday() as i64
        - date.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    let thursday = date + Duration::days(ahead);
    if is_past(thursday, at) {
        thursday + Duration::days(7)
    } else {
        thursday
    }
}

/// Last Thursday of the current month, rolling past the cutoff.
pub fn monthly_expiry(at: NaiveDateTime) -> NaiveDate {
    let date = at.date();
    let current = last_thursday(date.year(), date.month());
    if !is_past(current, at) {
        return current;
    }
    let next = date
        .with_day(1)
        .and_then(|d| d.checked_add_months(Months::new(1)))
        .unwrap_or(date);
    last_thursday(next.year(), next.month())
}

/// Last Thursday of the current or next quarter-end month.
pub fn quarterly_expiry(at: NaiveDateTime) -> NaiveDate {
    let mut cursor = at.date().with_day(1).unwrap_or(at.date());
    loop {
        if cursor.month() % 3 == 0 {
            let candidate = last_thursday(cursor.year(), cursor.month());
            if !is_past(candidate, at) {
                return candidate;
            }
        }
        cursor = match cursor.checked_add_months(Months::new(1)) {
            Some(next) => next,
            None => return cursor,
        };
    }
}

pub fn expiry_for(class: ExpiryClass, at: NaiveDateTime) -> NaiveDate {
    match class {
        ExpiryClass::Weekly => weekly_expiry(at),
        ExpiryClass::Monthly => monthly_expiry(at),
        ExpiryClass::Quarterly => quarterly_expiry(at),
    }
}

/// Fractional days from `at` until the expiry cutoff.
pub fn time_to_expiry_days(at: NaiveDateTime, expiry: NaiveDate) -> f64 {
    let close = NaiveDateTime::new(expiry, expiry_cutoff());
    (close - at).num_seconds() as f64 / 86_400.0
}

// =============================================================================
// Theoretical Price
// =============================================================================

/// Moneyness buckets with their time-value multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Moneyness {
    DeepItm,
    Itm,
    Atm,
    Otm,
    DeepOtm,
}

impl Moneyness {
    /// Bucket a signed moneyness ratio (positive is in the money).
    pub fn classify(ratio: f64) -> Self {
        if ratio.abs() <= 0.05 {
            Moneyness::Atm
        } else if ratio > 0.10 {
            Moneyness::DeepItm
        } else if ratio > 0.0 {
            Moneyness::Itm
        } else if ratio < -0.10 {
            Moneyness::DeepOtm
        } else {
            Moneyness::Otm
        }
    }

    pub fn multiplier(&self) -> f64 {
        match self {
            Moneyness::DeepItm => 0.3,
            Moneyness::Itm => 0.6,
            Moneyness::Atm => 1.0,
            Moneyness::Otm => 0.8,
            Moneyness::DeepOtm => 0.4,
        }
    }
}

/// Signed moneyness: `(U-K)/K` for calls, `(K-U)/K` for puts.
pub fn moneyness(kind: InstrumentKind, underlying: f64, strike: f64) -> f64 {
    if strike <= 0.0 {
        return 0.0;
    }
    match kind {
        InstrumentKind::Put => (strike - underlying) / strike,
        _ => (underlying - strike) / strike,
    }
}

pub fn intrinsic_value(kind: InstrumentKind, underlying: f64, strike: f64) -> f64 {
    match kind {
        InstrumentKind::Call => (underlying - strike).max(0.0),
        InstrumentKind::Put => (strike - underlying).max(0.0),
        InstrumentKind::Future | InstrumentKind::Equity => underlying,
    }
}

/// Annualised volatility (percent) assumed for an underlying.
pub fn default_volatility(underlying: &str) -> f64 {
    match underlying.trim().to_ascii_uppercase().as_str() {
        "NIFTY" | "SENSEX" => 15.0,
        "BANKNIFTY" => 18.0,
        "FINNIFTY" => 16.0,
        "MIDCPNIFTY" | "BANKEX" => 20.0,
        _ => 20.0,
    }
}

/// Intrinsic value plus bucketed time value, floored at [`PRICE_FLOOR`].
///
/// Futures and equity legs price at the underlying.
pub fn theoretical_price(
    kind: InstrumentKind,
    underlying: f64,
    strike: f64,
    days_to_expiry: f64,
    volatility_pct: f64,
) -> f64 {
    if !kind.is_option() {
        return underlying;
    }
    let intrinsic = intrinsic_value(kind, underlying, strike);
    let years = days_to_expiry.max(0.0) / DAYS_PER_YEAR;
    let bucket = Moneyness::classify(moneyness(kind, underlying, strike));
    let time_value = volatility_pct * underlying * 0.01 * years.sqrt() * bucket.multiplier();
    (intrinsic + time_value).max(PRICE_FLOOR)
}

// =============================================================================
// Market Adjustments
// =============================================================================

/// Liquidity class of an underlying's option chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liquidity {
    High,
    Normal,
    Low,
    VeryLow,
}

impl Liquidity {
    pub fn for_underlying(underlying: &str) -> Self {
        match underlying.trim().to_ascii_uppercase().as_str() {
            "NIFTY" | "BANKNIFTY" => Liquidity::High,
            "FINNIFTY" | "SENSEX" => Liquidity::Normal,
            "MIDCPNIFTY" | "BANKEX" => Liquidity::Low,
            _ => Liquidity::VeryLow,
        }
    }

    pub fn price_multiplier(&self) -> f64 {
        match self {
            Liquidity::High => 1.00,
            Liquidity::Normal => 1.05,
            Liquidity::Low => 1.15,
            Liquidity::VeryLow => 1.30,
        }
    }

    pub fn base_slippage_rate(&self) -> f64 {
        match self {
            Liquidity::High => 0.001,
            Liquidity::Normal => 0.0025,
            Liquidity::Low => 0.005,
            Liquidity::VeryLow => 0.01,
        }
    }
}

pub fn market_price(theoretical: f64, liquidity: Liquidity) -> f64 {
    theoretical * liquidity.price_multiplier()
}

/// Per-unit slippage for a fill of `quantity`.
pub fn slippage(market: f64, liquidity: Liquidity, quantity: u32) -> f64 {
    let scale = (1.0 + 0.1 * (quantity.max(1) as f64 - 1.0)).min(2.0);
    market * liquidity.base_slippage_rate() * scale
}

/// Apply slippage against the trader: buys fill higher, sells lower.
pub fn apply_slippage(price: f64, slippage: f64, side: OrderSide) -> f64 {
    match side {
        OrderSide::Buy => price + slippage,
        OrderSide::Sell => (price - slippage).max(0.0),
    }
}

/// Cost breakdown for one fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransactionCosts {
    pub brokerage: f64,
    pub transaction_tax: f64,
    pub exchange_fee: f64,
    pub regulatory_fee: f64,
    pub stamp_duty: f64,
}

impl TransactionCosts {
    pub fn on_notional(notional: f64) -> Self {
        let notional = notional.abs();
        Self {
            brokerage: (notional * 0.0003).max(20.0),
            transaction_tax: notional * 0.0005,
            exchange_fee: notional * 0.0001,
            regulatory_fee: notional * 0.000001,
            stamp_duty: (notional * 0.00015).max(1.0),
        }
    }

    pub fn total(&self) -> f64 {
        self.brokerage + self.transaction_tax + self.exchange_fee + self.regulatory_fee + self.stamp_duty
    }
}

// =============================================================================
// Pricing Model
// =============================================================================

/// A priced fill for one option leg.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionQuote {
    pub theoretical: f64,
    pub market: f64,
    /// Per-unit slippage
    pub slippage: f64,
    /// Market price moved by slippage in the fill direction
    pub fill: f64,
}

/// Pricing with an optional volatility override applied to every underlying.
#[derive(Debug, Clone, Default)]
pub struct PricingModel {
    volatility_override: Option<f64>,
}

impl PricingModel {
    pub fn new(volatility_override: Option<f64>) -> Self {
        Self { volatility_override }
    }

    pub fn volatility(&self, underlying: &str) -> f64 {
        self.volatility_override
            .unwrap_or_else(|| default_volatility(underlying))
    }

    /// Theoretical price for `underlying` at `spot`.
    pub fn theoretical(
        &self,
        underlying: &str,
        kind: InstrumentKind,
        spot: f64,
        strike: f64,
        days_to_expiry: f64,
    ) -> f64 {
        theoretical_price(kind, spot, strike, days_to_expiry, self.volatility(underlying))
    }

    /// Full fill price for a leg trading `quantity` on `side`.
    #[allow(clippy::too_many_arguments)]
    pub fn quote(
        &self,
        underlying: &str,
        kind: InstrumentKind,
        spot: f64,
        strike: f64,
        days_to_expiry: f64,
        side: OrderSide,
        quantity: u32,
    ) -> OptionQuote {
        let liquidity = Liquidity::for_underlying(underlying);
        let theoretical = self.theoretical(underlying, kind, spot, strike, days_to_expiry);
        let market = market_price(theoretical, liquidity);
        let slip = slippage(market, liquidity, quantity);
        OptionQuote {
            theoretical,
            market,
            slippage: slip,
            fill: apply_slippage(market, slip, side),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_strike_increments() {
        assert_eq!(strike_increment("NIFTY"), Some(50.0));
        assert_eq!(strike_increment("banknifty"), Some(100.0));
        assert_eq!(strike_increment("MIDCPNIFTY"), Some(25.0));
        assert_eq!(strike_increment("RELIANCE"), None);
    }

    #[test]
    fn test_atm_strike_properties() {
        for increment in [25.0, 50.0, 100.0] {
            let mut price = 17_000.0;
            while price < 17_500.0 {
                let strike = atm_strike(price, increment);
                assert!(is_valid_strike(strike, increment));
                assert!((strike - price).abs() <= increment / 2.0);
                price += 7.3;
            }
        }
    }

    #[test]
    fn test_itm_otm_sign_convention() {
        let call_itm = select_strike(22_010.0, 50.0, InstrumentKind::Call, StrikeSelection::Itm(100));
        let call_otm = select_strike(22_010.0, 50.0, InstrumentKind::Call, StrikeSelection::Otm(100));
        let put_itm = select_strike(22_010.0, 50.0, InstrumentKind::Put, StrikeSelection::Itm(100));
        let put_otm = select_strike(22_010.0, 50.0, InstrumentKind::Put, StrikeSelection::Otm(100));
        assert_eq!(call_itm, 21_900.0);
        assert_eq!(call_otm, 22_100.0);
        assert_eq!(put_itm, 22_100.0);
        assert_eq!(put_otm, 21_900.0);
    }

    #[test]
    fn test_weekly_expiry_rules() {
        // Wednesday -> next day
        assert_eq!(weekly_expiry(at(2024, 3, 13, 11, 0)), date(2024, 3, 14));
        // Thursday before close -> same day
        assert_eq!(weekly_expiry(at(2024, 3, 14, 10, 0)), date(2024, 3, 14));
        // Thursday after close -> a week later
        assert_eq!(weekly_expiry(at(2024, 3, 14, 16, 0)), date(2024, 3, 21));
        // Friday -> following Thursday
        assert_eq!(weekly_expiry(at(2024, 3, 15, 9, 15)), date(2024, 3, 21));
    }

    #[test]
    fn test_monthly_and_quarterly_expiry() {
        assert_eq!(monthly_expiry(at(2024, 3, 5, 10, 0)), date(2024, 3, 28));
        assert_eq!(monthly_expiry(at(2024, 3, 28, 15, 30)), date(2024, 4, 25));
        assert_eq!(quarterly_expiry(at(2024, 1, 10, 10, 0)), date(2024, 3, 28));
        assert_eq!(quarterly_expiry(at(2024, 3, 29, 10, 0)), date(2024, 6, 27));
        assert_eq!(quarterly_expiry(at(2024, 12, 27, 10, 0)), date(2025, 3, 27));
    }

    #[test]
    fn test_time_to_expiry() {
        let days = time_to_expiry_days(at(2024, 3, 13, 15, 30), date(2024, 3, 14));
        assert!((days - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_moneyness_buckets() {
        assert_eq!(Moneyness::classify(0.05), Moneyness::Atm);
        assert_eq!(Moneyness::classify(-0.05), Moneyness::Atm);
        assert_eq!(Moneyness::classify(0.08), Moneyness::Itm);
        assert_eq!(Moneyness::classify(0.10), Moneyness::Itm);
        assert_eq!(Moneyness::classify(0.11), Moneyness::DeepItm);
        assert_eq!(Moneyness::classify(-0.08), Moneyness::Otm);
        assert_eq!(Moneyness::classify(-0.2), Moneyness::DeepOtm);
    }

    #[test]
    fn test_theoretical_price_floor_and_intrinsic() {
        for kind in [InstrumentKind::Call, InstrumentKind::Put] {
            for underlying in [15_000.0, 21_000.0, 22_000.0, 23_000.0, 30_000.0] {
                for days in [0.0, 0.5, 1.0, 7.0, 30.0] {
                    let price = theoretical_price(kind, underlying, 22_000.0, days, 15.0);
                    assert!(price >= PRICE_FLOOR);
                    assert!(price >= intrinsic_value(kind, underlying, 22_000.0));
                }
            }
        }
    }

    #[test]
    fn test_atm_time_value() {
        // 15 vol, 22000 spot, 73 days: 15 * 22000 * 0.01 * sqrt(0.2)
        let price = theoretical_price(InstrumentKind::Call, 22_000.0, 22_000.0, 73.0, 15.0);
        let expected = 3_300.0 * 0.2_f64.sqrt();
        assert!((price - expected).abs() < 1e-6);
    }

    #[test]
    fn test_slippage_scaling_caps_at_double() {
        let one = slippage(100.0, Liquidity::High, 1);
        let five = slippage(100.0, Liquidity::High, 5);
        let many = slippage(100.0, Liquidity::High, 500);
        assert!((one - 0.1).abs() < 1e-12);
        assert!((five - 0.14).abs() < 1e-12);
        assert!((many - 0.2).abs() < 1e-12);
        assert!((apply_slippage(100.0, 0.2, OrderSide::Buy) - 100.2).abs() < 1e-9);
        assert!((apply_slippage(100.0, 0.2, OrderSide::Sell) - 99.8).abs() < 1e-9);
    }

    #[test]
    fn test_brokerage_floor() {
        let costs = TransactionCosts::on_notional(1_000.0);
        assert!(costs.brokerage >= 20.0);
        assert_eq!(costs.stamp_duty, 1.0);
        assert!((costs.total() - (20.0 + 0.5 + 0.1 + 0.001 + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_quote_applies_liquidity() {
        let model = PricingModel::new(None);
        let quote = model.quote("FINNIFTY", InstrumentKind::Call, 20_000.0, 20_000.0, 7.0, OrderSide::Buy, 1);
        assert!((quote.market - quote.theoretical * 1.05).abs() < 1e-9);
        assert!(quote.fill > quote.market);

        let flat = PricingModel::new(Some(30.0));
        assert_eq!(flat.volatility("NIFTY"), 30.0);
    }
}
