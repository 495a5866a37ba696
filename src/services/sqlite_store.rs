//! SQLite persistence layer.
//!
//! Holds what the engine reads from the surrounding platform and what it
//! writes back:
//! - Strategies and broker connections (read; status and health written)
//! - Price bars and the instrument master (read; ingestion helpers for tests)
//! - Order, trade and backtest result records (written)

use crate::types::{
    BacktestResult, Bar, BrokerConnection, BrokerCredentials, BrokerKind, ExchangeSegment,
    Instrument, InstrumentKind, OrderRecord, OrderStatus, Strategy, StrategyStatus, TradeRecord,
};
use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

type StoreResult<T> = Result<T, rusqlite::Error>;

fn to_json<T: Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json<T: DeserializeOwned>(column: usize, text: &str) -> StoreResult<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn parse_column<T>(column: usize, value: Option<T>, raw: &str) -> StoreResult<T> {
    value.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            Type::Text,
            format!("unrecognised value '{}'", raw).into(),
        )
    })
}

/// SQLite store for engine state.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create a new SQLite store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("SQLite store initialized");
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub fn new_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("In-memory SQLite store initialized");
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS strategies (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                broker TEXT NOT NULL,
                status TEXT NOT NULL,
                config_json TEXT NOT NULL,
                last_run_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_strategies_owner ON strategies(owner_id);
            CREATE INDEX IF NOT EXISTS idx_strategies_status ON strategies(status);

            CREATE TABLE IF NOT EXISTS broker_connections (
                user_id TEXT NOT NULL,
                broker TEXT NOT NULL,
                credentials_json TEXT NOT NULL,
                is_connected INTEGER NOT NULL DEFAULT 1,
                last_error TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, broker)
            );

            CREATE TABLE IF NOT EXISTS bars (
                symbol TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (symbol, timestamp)
            );

            CREATE TABLE IF NOT EXISTS instruments (
                security_id TEXT NOT NULL,
                exchange_segment TEXT NOT NULL,
                trading_symbol TEXT NOT NULL,
                underlying TEXT NOT NULL,
                kind TEXT NOT NULL,
                strike REAL,
                expiry TEXT,
                lot_size INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (security_id, exchange_segment)
            );
            CREATE INDEX IF NOT EXISTS idx_instruments_lookup
                ON instruments(underlying, kind, expiry, strike);
            CREATE INDEX IF NOT EXISTS idx_instruments_symbol ON instruments(trading_symbol);

            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                broker TEXT NOT NULL,
                broker_order_id TEXT,
                status TEXT NOT NULL,
                filled_quantity INTEGER NOT NULL DEFAULT 0,
                average_price REAL,
                error_code TEXT,
                error_message TEXT,
                spec_json TEXT NOT NULL,
                context_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id, created_at DESC);

            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                record_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_strategy ON trades(strategy_id, created_at);

            CREATE TABLE IF NOT EXISTS backtest_results (
                id TEXT PRIMARY KEY,
                strategy_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                period TEXT NOT NULL,
                total_return_pct REAL NOT NULL,
                result_json TEXT NOT NULL,
                run_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_backtests_strategy
                ON backtest_results(strategy_id, run_at DESC);",
        )?;

        info!("SQLite schema initialized");
        Ok(())
    }

    // ========== Strategy Methods ==========

    /// Insert or replace a strategy definition.
    pub fn save_strategy(&self, strategy: &Strategy) -> StoreResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO strategies
             (id, owner_id, name, broker, status, config_json, last_run_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                strategy.id,
                strategy.owner_id,
                strategy.name,
                strategy.broker.to_string(),
                strategy.status.to_string(),
                to_json(strategy)?,
                strategy.last_run_at,
                strategy.created_at,
                strategy.updated_at,
            ],
        )?;
        Ok(())
    }

    fn strategy_from_row(row: &Row<'_>) -> StoreResult<Strategy> {
        let config_json: String = row.get(0)?;
        let status_raw: String = row.get(1)?;
        let mut strategy: Strategy = from_json(0, &config_json)?;
        // Columns are authoritative for mutable fields
        strategy.status = parse_column(1, StrategyStatus::parse(&status_raw), &status_raw)?;
        strategy.last_run_at = row.get(2)?;
        strategy.updated_at = row.get(3)?;
        Ok(strategy)
    }

    /// Get a strategy by ID.
    pub fn get_strategy(&self, id: &str) -> StoreResult<Option<Strategy>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT config_json, status, last_run_at, updated_at FROM strategies WHERE id = ?1",
            params![id],
            Self::strategy_from_row,
        )
        .optional()
    }

    /// All strategies currently in `status`.
    pub fn strategies_with_status(&self, status: StrategyStatus) -> StoreResult<Vec<Strategy>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT config_json, status, last_run_at, updated_at FROM strategies
             WHERE status = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![status.to_string()], Self::strategy_from_row)?;
        rows.collect()
    }

    pub fn update_strategy_status(&self, id: &str, status: StrategyStatus) -> StoreResult<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE strategies SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.to_string(), chrono::Utc::now().timestamp_millis(), id],
        )?;
        Ok(changed > 0)
    }

    /// Record a run without touching the status column.
    pub fn set_last_run_at(&self, id: &str, timestamp: i64) -> StoreResult<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE strategies SET last_run_at = ?1 WHERE id = ?2",
            params![timestamp, id],
        )?;
        Ok(())
    }

    // ========== Broker Connection Methods ==========

    pub fn save_broker_connection(&self, connection: &BrokerConnection) -> StoreResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO broker_connections
             (user_id, broker, credentials_json, is_connected, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                connection.user_id,
                connection.broker.to_string(),
                to_json(&connection.credentials)?,
                connection.is_connected,
                connection.last_error,
                connection.updated_at,
            ],
        )?;
        Ok(())
    }

    /// A user's connection for `broker`, connected or not.
    pub fn get_broker_connection(
        &self,
        user_id: &str,
        broker: BrokerKind,
    ) -> StoreResult<Option<BrokerConnection>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT credentials_json, is_connected, last_error, updated_at
             FROM broker_connections WHERE user_id = ?1 AND broker = ?2",
            params![user_id, broker.to_string()],
            |row| {
                let credentials_json: String = row.get(0)?;
                let credentials: BrokerCredentials = from_json(0, &credentials_json)?;
                Ok(BrokerConnection {
                    user_id: user_id.to_string(),
                    broker,
                    credentials,
                    is_connected: row.get(1)?,
                    last_error: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            },
        )
        .optional()
    }

    /// Flag a connection unhealthy after a broker failure.
    pub fn mark_connection_unhealthy(
        &self,
        user_id: &str,
        broker: BrokerKind,
        error: &str,
    ) -> StoreResult<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE broker_connections SET is_connected = 0, last_error = ?1, updated_at = ?2
             WHERE user_id = ?3 AND broker = ?4",
            params![error, chrono::Utc::now().timestamp_millis(), user_id, broker.to_string()],
        )?;
        Ok(())
    }

    // ========== Bar Methods ==========

    /// Insert bars, ignoring any `(symbol, timestamp)` already stored.
    pub fn insert_bars(&self, bars: &[Bar]) -> StoreResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO bars (symbol, timestamp, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for bar in bars {
                inserted += stmt.execute(params![
                    bar.symbol, bar.timestamp, bar.open, bar.high, bar.low, bar.close, bar.volume
                ])?;
            }
        }
        tx.commit()?;
        debug!("Inserted {} of {} bars", inserted, bars.len());
        Ok(inserted)
    }

    fn bar_from_row(row: &Row<'_>) -> StoreResult<Bar> {
        Ok(Bar {
            symbol: row.get(0)?,
            timestamp: row.get(1)?,
            open: row.get(2)?,
            high: row.get(3)?,
            low: row.get(4)?,
            close: row.get(5)?,
            volume: row.get(6)?,
        })
    }

    /// Bars for `symbol` with `from_ms <= timestamp <= to_ms`, oldest first.
    pub fn bars_in_range(&self, symbol: &str, from_ms: i64, to_ms: i64) -> StoreResult<Vec<Bar>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT symbol, timestamp, open, high, low, close, volume FROM bars
             WHERE symbol = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![symbol, from_ms, to_ms], Self::bar_from_row)?;
        rows.collect()
    }

    /// The last `limit` bars at or before `to_ms`, oldest first.
    pub fn recent_bars(&self, symbol: &str, to_ms: i64, limit: usize) -> StoreResult<Vec<Bar>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT symbol, timestamp, open, high, low, close, volume FROM bars
             WHERE symbol = ?1 AND timestamp <= ?2
             ORDER BY timestamp DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![symbol, to_ms, limit as i64], Self::bar_from_row)?;
        let mut bars = rows.collect::<StoreResult<Vec<_>>>()?;
        bars.reverse();
        Ok(bars)
    }

    pub fn latest_bar(&self, symbol: &str) -> StoreResult<Option<Bar>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT symbol, timestamp, open, high, low, close, volume FROM bars
             WHERE symbol = ?1 ORDER BY timestamp DESC LIMIT 1",
            params![symbol],
            Self::bar_from_row,
        )
        .optional()
    }

    // ========== Instrument Methods ==========

    pub fn save_instrument(&self, instrument: &Instrument) -> StoreResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO instruments
             (security_id, exchange_segment, trading_symbol, underlying, kind, strike, expiry, lot_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                instrument.security_id,
                instrument.exchange_segment.to_string(),
                instrument.trading_symbol,
                instrument.underlying.to_ascii_uppercase(),
                instrument.kind.suffix(),
                instrument.strike,
                instrument.expiry.map(|d| d.to_string()),
                instrument.lot_size,
            ],
        )?;
        Ok(())
    }

    fn instrument_from_row(row: &Row<'_>) -> StoreResult<Instrument> {
        let segment_raw: String = row.get(1)?;
        let kind_raw: String = row.get(4)?;
        let expiry_raw: Option<String> = row.get(6)?;
        let kind = match kind_raw.as_str() {
            "CE" => Some(InstrumentKind::Call),
            "PE" => Some(InstrumentKind::Put),
            "FUT" => Some(InstrumentKind::Future),
            "EQ" => Some(InstrumentKind::Equity),
            _ => None,
        };
        let expiry = match expiry_raw {
            Some(raw) => Some(parse_column(6, NaiveDate::parse_from_str(&raw, "%Y-%m-%d").ok(), &raw)?),
            None => None,
        };
        Ok(Instrument {
            security_id: row.get(0)?,
            exchange_segment: parse_column(1, ExchangeSegment::parse(&segment_raw), &segment_raw)?,
            trading_symbol: row.get(2)?,
            underlying: row.get(3)?,
            kind: parse_column(4, kind, &kind_raw)?,
            strike: row.get(5)?,
            expiry,
            lot_size: row.get(7)?,
        })
    }

    /// Resolve a derivative contract.
    ///
    /// Options match strike and expiry exactly; futures take the nearest
    /// expiry on or after `expiry`; equities match on the symbol.
    pub fn find_contract(
        &self,
        underlying: &str,
        kind: InstrumentKind,
        strike: Option<f64>,
        expiry: Option<NaiveDate>,
    ) -> StoreResult<Option<Instrument>> {
        let conn = self.conn();
        let underlying = underlying.to_ascii_uppercase();
        let expiry = expiry.map(|d| d.to_string());
        let columns = "SELECT security_id, exchange_segment, trading_symbol, underlying, kind,
                       strike, expiry, lot_size FROM instruments";
        match kind {
            InstrumentKind::Call | InstrumentKind::Put => conn
                .query_row(
                    &format!(
                        "{} WHERE underlying = ?1 AND kind = ?2 AND strike = ?3 AND expiry = ?4",
                        columns
                    ),
                    params![underlying, kind.suffix(), strike, expiry],
                    Self::instrument_from_row,
                )
                .optional(),
            InstrumentKind::Future => conn
                .query_row(
                    &format!(
                        "{} WHERE underlying = ?1 AND kind = 'FUT' AND expiry >= ?2
                         ORDER BY expiry ASC LIMIT 1",
                        columns
                    ),
                    params![underlying, expiry.unwrap_or_default()],
                    Self::instrument_from_row,
                )
                .optional(),
            InstrumentKind::Equity => conn
                .query_row(
                    &format!("{} WHERE underlying = ?1 AND kind = 'EQ' LIMIT 1", columns),
                    params![underlying],
                    Self::instrument_from_row,
                )
                .optional(),
        }
    }

    /// Resolve an instrument by its trading symbol.
    pub fn find_by_symbol(&self, trading_symbol: &str) -> StoreResult<Option<Instrument>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT security_id, exchange_segment, trading_symbol, underlying, kind,
             strike, expiry, lot_size FROM instruments
             WHERE trading_symbol = ?1 OR (underlying = ?2 AND kind = 'EQ')
             ORDER BY trading_symbol = ?1 DESC LIMIT 1",
            params![trading_symbol, trading_symbol.to_ascii_uppercase()],
            Self::instrument_from_row,
        )
        .optional()
    }

    // ========== Order & Trade Methods ==========

    /// Insert or update an order record.
    pub fn save_order(&self, order: &OrderRecord) -> StoreResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO orders
             (id, user_id, strategy_id, broker, broker_order_id, status, filled_quantity,
              average_price, error_code, error_message, spec_json, context_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                order.id,
                order.user_id,
                order.strategy_id,
                order.broker.to_string(),
                order.broker_order_id,
                order.status.to_string(),
                order.filled_quantity,
                order.average_price,
                order.error_code,
                order.error_message,
                to_json(&order.spec)?,
                to_json(&order.context)?,
                order.created_at,
                order.updated_at,
            ],
        )?;
        Ok(())
    }

    fn order_from_row(row: &Row<'_>) -> StoreResult<OrderRecord> {
        let broker_raw: String = row.get(3)?;
        let status_raw: String = row.get(5)?;
        let spec_json: String = row.get(10)?;
        let context_json: String = row.get(11)?;
        Ok(OrderRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            strategy_id: row.get(2)?,
            broker: parse_column(3, BrokerKind::parse(&broker_raw), &broker_raw)?,
            broker_order_id: row.get(4)?,
            status: parse_column(5, OrderStatus::parse(&status_raw), &status_raw)?,
            filled_quantity: row.get(6)?,
            average_price: row.get(7)?,
            error_code: row.get(8)?,
            error_message: row.get(9)?,
            spec: from_json(10, &spec_json)?,
            context: from_json(11, &context_json)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    pub fn get_order(&self, id: &str) -> StoreResult<Option<OrderRecord>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, user_id, strategy_id, broker, broker_order_id, status, filled_quantity,
             average_price, error_code, error_message, spec_json, context_json, created_at, updated_at
             FROM orders WHERE id = ?1",
            params![id],
            Self::order_from_row,
        )
        .optional()
    }

    /// Most recent orders for a user, newest first.
    pub fn orders_for_user(&self, user_id: &str, limit: usize) -> StoreResult<Vec<OrderRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, strategy_id, broker, broker_order_id, status, filled_quantity,
             average_price, error_code, error_message, spec_json, context_json, created_at, updated_at
             FROM orders WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], Self::order_from_row)?;
        rows.collect()
    }

    pub fn save_trade(&self, trade: &TradeRecord) -> StoreResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO trades (id, order_id, user_id, strategy_id, record_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                trade.id,
                trade.order_id,
                trade.user_id,
                trade.strategy_id,
                to_json(trade)?,
                trade.created_at,
            ],
        )?;
        Ok(())
    }

    /// Trade ledger for a strategy, oldest first.
    pub fn trades_for_strategy(&self, strategy_id: &str) -> StoreResult<Vec<TradeRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT record_json FROM trades WHERE strategy_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![strategy_id], |row| {
            let json: String = row.get(0)?;
            from_json(0, &json)
        })?;
        rows.collect()
    }

    // ========== Backtest Methods ==========

    pub fn save_backtest_result(&self, result: &BacktestResult) -> StoreResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO backtest_results
             (id, strategy_id, user_id, period, total_return_pct, result_json, run_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                result.id,
                result.strategy_id,
                result.user_id,
                result.period.to_string(),
                result.total_return_pct,
                to_json(result)?,
                result.run_at,
            ],
        )?;
        Ok(())
    }

    /// Backtest runs for a strategy, newest first.
    pub fn backtest_results(&self, strategy_id: &str) -> StoreResult<Vec<BacktestResult>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT result_json FROM backtest_results WHERE strategy_id = ?1 ORDER BY run_at DESC",
        )?;
        let rows = stmt.query_map(params![strategy_id], |row| {
            let json: String = row.get(0)?;
            from_json(0, &json)
        })?;
        rows.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        exchange_timestamp_ms, OrderLeg, OrderSide, OrderSpec, StrategyKind, TradeContext,
    };
    use chrono::NaiveTime;

    fn strategy() -> Strategy {
        Strategy::new(
            "user-1".to_string(),
            "Straddle".to_string(),
            BrokerKind::AngelOne,
            StrategyKind::TimeBased {
                underlying: "NIFTY".to_string(),
                legs: vec![OrderLeg::option(OrderSide::Sell, InstrumentKind::Call, 50)],
            },
        )
    }

    fn bar(day: u32, close: f64) -> Bar {
        let date = NaiveDate::from_ymd_opt(2024, 3, day).unwrap();
        Bar {
            symbol: "NIFTY".to_string(),
            timestamp: exchange_timestamp_ms(date, NaiveTime::from_hms_opt(9, 15, 0).unwrap()),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1_000.0,
        }
    }

    #[test]
    fn test_strategy_round_trip_and_status() {
        let store = SqliteStore::new_in_memory().unwrap();
        let strategy = strategy();
        store.save_strategy(&strategy).unwrap();

        assert!(store.update_strategy_status(&strategy.id, StrategyStatus::Active).unwrap());
        store.set_last_run_at(&strategy.id, 42).unwrap();

        let loaded = store.get_strategy(&strategy.id).unwrap().unwrap();
        assert_eq!(loaded.status, StrategyStatus::Active);
        assert_eq!(loaded.last_run_at, Some(42));
        assert_eq!(store.strategies_with_status(StrategyStatus::Active).unwrap().len(), 1);
        assert!(store.get_strategy("missing").unwrap().is_none());
        assert!(!store.update_strategy_status("missing", StrategyStatus::Stopped).unwrap());
    }

    #[test]
    fn test_bars_are_insert_or_ignore() {
        let store = SqliteStore::new_in_memory().unwrap();
        assert_eq!(store.insert_bars(&[bar(11, 100.0), bar(12, 101.0)]).unwrap(), 2);

        // Same key with a different close is ignored
        assert_eq!(store.insert_bars(&[bar(12, 999.0), bar(13, 102.0)]).unwrap(), 1);

        let all = store.bars_in_range("NIFTY", 0, i64::MAX).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].close, 101.0);
        assert_eq!(store.latest_bar("NIFTY").unwrap().unwrap().close, 102.0);

        let recent = store.recent_bars("NIFTY", i64::MAX, 2).unwrap();
        assert_eq!(recent.iter().map(|b| b.close).collect::<Vec<_>>(), vec![101.0, 102.0]);
    }

    #[test]
    fn test_broker_connection_health() {
        let store = SqliteStore::new_in_memory().unwrap();
        let conn = BrokerConnection::new(
            "user-1".to_string(),
            BrokerKind::Dhan,
            BrokerCredentials {
                client_id: "1000".to_string(),
                access_token: "token".to_string(),
                api_key: None,
            },
        );
        store.save_broker_connection(&conn).unwrap();
        store
            .mark_connection_unhealthy("user-1", BrokerKind::Dhan, "token expired")
            .unwrap();

        let loaded = store.get_broker_connection("user-1", BrokerKind::Dhan).unwrap().unwrap();
        assert!(!loaded.is_connected);
        assert_eq!(loaded.last_error.as_deref(), Some("token expired"));
        assert_eq!(loaded.credentials.access_token, "token");
        assert!(store.get_broker_connection("user-1", BrokerKind::AngelOne).unwrap().is_none());
    }

    #[test]
    fn test_find_contract() {
        let store = SqliteStore::new_in_memory().unwrap();
        let expiry = NaiveDate::from_ymd_opt(2024, 3, 14).unwrap();
        store
            .save_instrument(&Instrument {
                security_id: "43210".to_string(),
                trading_symbol: "NIFTY14MAR2422000CE".to_string(),
                underlying: "NIFTY".to_string(),
                kind: InstrumentKind::Call,
                strike: Some(22_000.0),
                expiry: Some(expiry),
                exchange_segment: ExchangeSegment::NseFno,
                lot_size: 50,
            })
            .unwrap();

        let found = store
            .find_contract("nifty", InstrumentKind::Call, Some(22_000.0), Some(expiry))
            .unwrap()
            .unwrap();
        assert_eq!(found.security_id, "43210");
        assert_eq!(found.expiry, Some(expiry));
        assert!(store
            .find_contract("NIFTY", InstrumentKind::Put, Some(22_000.0), Some(expiry))
            .unwrap()
            .is_none());
        assert!(store.find_by_symbol("NIFTY14MAR2422000CE").unwrap().is_some());
    }

    #[test]
    fn test_order_and_trade_records() {
        let store = SqliteStore::new_in_memory().unwrap();
        let order = OrderRecord {
            id: "order-1".to_string(),
            user_id: "user-1".to_string(),
            strategy_id: "strat-1".to_string(),
            broker: BrokerKind::AngelOne,
            broker_order_id: None,
            status: OrderStatus::Failed,
            filled_quantity: 0,
            average_price: None,
            error_code: Some("timeout".to_string()),
            error_message: Some("broker request timed out".to_string()),
            spec: OrderSpec::market(
                OrderSide::Buy,
                ExchangeSegment::NseFno,
                "43210".to_string(),
                "NIFTY14MAR2422000CE".to_string(),
                50,
            ),
            context: TradeContext {
                entry_condition: "BUY CE ATM x50".to_string(),
                ..Default::default()
            },
            created_at: 1,
            updated_at: 1,
        };
        store.save_order(&order).unwrap();
        store.save_trade(&TradeRecord::from_order(&order)).unwrap();

        let loaded = store.get_order("order-1").unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Failed);
        assert_eq!(loaded.error_code.as_deref(), Some("timeout"));
        assert_eq!(loaded.spec.quantity, 50);

        let trades = store.trades_for_strategy("strat-1").unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].entry_condition, "BUY CE ATM x50");
        assert_eq!(store.orders_for_user("user-1", 10).unwrap().len(), 1);
    }
}
