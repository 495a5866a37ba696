use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{ExchangeSegment, InstrumentKind};

/// Exchange-local offset from UTC (IST, +05:30).
pub const EXCHANGE_UTC_OFFSET_SECS: i32 = 19_800;

/// Exchange-local timezone.
pub fn exchange_offset() -> FixedOffset {
    FixedOffset::east_opt(EXCHANGE_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

/// Convert epoch milliseconds to exchange-local time.
pub fn to_exchange_time(timestamp_ms: i64) -> DateTime<FixedOffset> {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .unwrap_or_default()
        .with_timezone(&exchange_offset())
}

/// Epoch milliseconds of an exchange-local date and time.
pub fn exchange_timestamp_ms(date: NaiveDate, time: NaiveTime) -> i64 {
    NaiveDateTime::new(date, time).and_utc().timestamp_millis()
        - i64::from(EXCHANGE_UTC_OFFSET_SECS) * 1000
}

/// One OHLCV price bar.
///
/// Bars are immutable once stored; `(symbol, timestamp)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub symbol: String,
    /// Milliseconds since epoch (UTC)
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Bar {
    pub fn local_time(&self) -> DateTime<FixedOffset> {
        to_exchange_time(self.timestamp)
    }

    pub fn date(&self) -> NaiveDate {
        self.local_time().date_naive()
    }

    /// A bar stamped exactly at local midnight covers the whole session.
    pub fn is_session_bar(&self) -> bool {
        self.local_time().time() == NaiveTime::MIN
    }
}

/// Tradable instrument from the instrument master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    /// Broker security token
    pub security_id: String,
    pub trading_symbol: String,
    pub underlying: String,
    pub kind: InstrumentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strike: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<NaiveDate>,
    pub exchange_segment: ExchangeSegment,
    #[serde(default = "default_lot_size")]
    pub lot_size: u32,
}

fn default_lot_size() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_timestamp_round_trip() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 11).unwrap();
        let time = NaiveTime::from_hms_opt(9, 15, 0).unwrap();
        let ms = exchange_timestamp_ms(date, time);
        // 09:15 IST is 03:45 UTC
        assert_eq!(
            Utc.timestamp_millis_opt(ms).unwrap().time(),
            NaiveTime::from_hms_opt(3, 45, 0).unwrap()
        );
        let local = to_exchange_time(ms);
        assert_eq!(local.date_naive(), date);
        assert_eq!(local.time(), time);
    }

    #[test]
    fn test_session_bar_detection() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 11).unwrap();
        let mut bar = Bar {
            symbol: "NIFTY".to_string(),
            timestamp: exchange_timestamp_ms(date, NaiveTime::MIN),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
        };
        assert!(bar.is_session_bar());
        assert_eq!(bar.date(), date);

        bar.timestamp += 60_000;
        assert!(!bar.is_session_bar());
    }
}
