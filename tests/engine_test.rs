//! Trading engine integration tests
//!
//! Lifecycle, scheduling and dispatch against an in-memory store and a
//! scripted broker.

use algodesk::brokers::{BrokerAdapter, BrokerError, BrokerFactory, BrokerResult};
use algodesk::config::Config;
use algodesk::error::EngineError;
use algodesk::services::pricing::weekly_expiry;
use algodesk::services::scheduler::exchange_now;
use algodesk::services::{SqliteStore, TradingEngine};
use algodesk::{
    exchange_offset, BrokerConnection, BrokerCredentials, BrokerKind, BrokerOrder, BrokerPosition,
    BrokerProfile, ExchangeSegment, Funds, Holding, Instrument, InstrumentKind, OrderAck, OrderLeg,
    OrderSide, OrderSpec, OrderStatus, QueuedOrder, Strategy, StrategyKind, StrategyStatus,
    TradeContext,
};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, TimeZone, Weekday};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};

// =============================================================================
// Test brokers
// =============================================================================

enum Behaviour {
    Accept,
    Expired,
    /// Hold every submission until notified
    Block(Arc<Notify>),
}

struct MockBroker {
    kind: BrokerKind,
    behaviour: Behaviour,
    placed: Mutex<Vec<OrderSpec>>,
}

impl MockBroker {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Self::on(BrokerKind::Dhan, behaviour)
    }

    fn on(kind: BrokerKind, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            kind,
            behaviour,
            placed: Mutex::new(Vec::new()),
        })
    }

    fn placed(&self) -> Vec<OrderSpec> {
        self.placed.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerAdapter for MockBroker {
    fn kind(&self) -> BrokerKind {
        self.kind
    }

    async fn place_order(&self, spec: &OrderSpec) -> BrokerResult<OrderAck> {
        match &self.behaviour {
            Behaviour::Accept => {}
            Behaviour::Expired => {
                return Err(BrokerError::Authentication("session expired".to_string()));
            }
            Behaviour::Block(gate) => gate.notified().await,
        }
        let mut placed = self.placed.lock().unwrap();
        placed.push(spec.clone());
        Ok(OrderAck {
            order_id: format!("{}-{}", self.kind, placed.len()),
            status: OrderStatus::Filled,
            raw_status: "TRADED".to_string(),
        })
    }

    async fn cancel_order(&self, _order_id: &str) -> BrokerResult<()> {
        Ok(())
    }

    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        Ok(Vec::new())
    }

    async fn get_order_book(&self) -> BrokerResult<Vec<BrokerOrder>> {
        Ok(Vec::new())
    }

    async fn get_holdings(&self) -> BrokerResult<Vec<Holding>> {
        Ok(Vec::new())
    }

    async fn get_funds(&self) -> BrokerResult<Funds> {
        Ok(Funds::default())
    }

    async fn test_connection(&self) -> BrokerResult<BrokerProfile> {
        Ok(BrokerProfile {
            broker: self.kind,
            client_id: "1000000001".to_string(),
            name: None,
        })
    }
}

/// Hands out the same adapter for every connection.
struct SharedFactory(Arc<MockBroker>);

impl BrokerFactory for SharedFactory {
    fn connect(&self, _connection: &BrokerConnection) -> BrokerResult<Arc<dyn BrokerAdapter>> {
        Ok(self.0.clone())
    }
}

/// One adapter per broker, picked by the connection being bound.
struct PerBrokerFactory {
    dhan: Arc<MockBroker>,
    angel_one: Arc<MockBroker>,
}

impl BrokerFactory for PerBrokerFactory {
    fn connect(&self, connection: &BrokerConnection) -> BrokerResult<Arc<dyn BrokerAdapter>> {
        let adapter = match connection.broker {
            BrokerKind::Dhan => self.dhan.clone(),
            BrokerKind::AngelOne => self.angel_one.clone(),
        };
        Ok(adapter)
    }
}

// =============================================================================
// Fixtures
// =============================================================================

struct Harness {
    engine: Arc<TradingEngine>,
    store: Arc<SqliteStore>,
    broker: Arc<MockBroker>,
}

fn harness(behaviour: Behaviour) -> Harness {
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());
    let broker = MockBroker::new(behaviour);
    let engine = Arc::new(TradingEngine::new(
        &Config::default(),
        store.clone(),
        Arc::new(SharedFactory(broker.clone())),
    ));
    Harness { engine, store, broker }
}

fn connect(store: &SqliteStore, user_id: &str) {
    connect_to(store, user_id, BrokerKind::Dhan);
}

fn connect_to(store: &SqliteStore, user_id: &str, broker: BrokerKind) {
    let credentials = BrokerCredentials {
        client_id: "1000000001".to_string(),
        access_token: "token".to_string(),
        api_key: None,
    };
    store
        .save_broker_connection(&BrokerConnection::new(user_id.to_string(), broker, credentials))
        .unwrap();
}

fn short_call(owner: &str, underlying: &str) -> Strategy {
    Strategy::new(
        owner.to_string(),
        format!("{} short call", underlying),
        BrokerKind::Dhan,
        StrategyKind::TimeBased {
            underlying: underlying.to_string(),
            legs: vec![OrderLeg::option(OrderSide::Sell, InstrumentKind::Call, 50)],
        },
    )
}

/// The first Monday after today, so freshly started strategies are already due.
fn next_monday() -> NaiveDate {
    let mut day = exchange_now().date_naive() + ChronoDuration::days(1);
    while day.weekday() != Weekday::Mon {
        day += ChronoDuration::days(1);
    }
    day
}

fn local(day: NaiveDate, h: u32, m: u32) -> DateTime<FixedOffset> {
    exchange_offset()
        .with_ymd_and_hms(day.year(), day.month(), day.day(), h, m, 0)
        .single()
        .unwrap()
}

fn list_call(store: &SqliteStore, underlying: &str, strike: f64, expiry: NaiveDate) {
    store
        .save_instrument(&Instrument {
            security_id: format!("{}{}", underlying, strike),
            trading_symbol: format!("{}-{}-{}-CE", underlying, expiry, strike),
            underlying: underlying.to_string(),
            kind: InstrumentKind::Call,
            strike: Some(strike),
            expiry: Some(expiry),
            exchange_segment: ExchangeSegment::NseFno,
            lot_size: 50,
        })
        .unwrap();
}

fn queued(user_id: &str) -> QueuedOrder {
    let spec = OrderSpec::market(
        OrderSide::Buy,
        ExchangeSegment::NseEq,
        "2885".to_string(),
        "RELIANCE-EQ".to_string(),
        1,
    );
    QueuedOrder::new(user_id.to_string(), "s1".to_string(), spec, TradeContext::default())
}

async fn drain(engine: &TradingEngine) {
    for handle in engine.dispatcher().drain_cycle() {
        handle.await.unwrap();
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_start_requires_connected_broker() {
    let h = harness(Behaviour::Accept);
    let strategy = short_call("user-1", "NIFTY");
    h.store.save_strategy(&strategy).unwrap();

    let err = h.engine.start_strategy(&strategy.id).unwrap_err();
    assert!(matches!(err, EngineError::NoBrokerConnection { broker: BrokerKind::Dhan, .. }));
    assert_eq!(h.engine.engine_status().active_strategy_count, 0);
    let stored = h.store.get_strategy(&strategy.id).unwrap().unwrap();
    assert_eq!(stored.status, StrategyStatus::Draft);
}

#[test]
fn test_start_and_stop_are_idempotent() {
    let h = harness(Behaviour::Accept);
    connect(&h.store, "user-1");
    let strategy = short_call("user-1", "NIFTY");
    h.store.save_strategy(&strategy).unwrap();

    assert!(assert_ok!(h.engine.start_strategy(&strategy.id)).activated);
    assert!(assert_ok!(h.engine.start_strategy(&strategy.id)).activated);
    assert_eq!(h.engine.engine_status().active_strategy_count, 1);
    assert_eq!(h.engine.active_strategies("user-1").len(), 1);
    assert!(h.engine.active_strategies("user-2").is_empty());
    assert_eq!(
        h.store.get_strategy(&strategy.id).unwrap().unwrap().status,
        StrategyStatus::Active
    );

    assert!(assert_ok!(h.engine.stop_strategy(&strategy.id)).stopped);
    assert!(assert_ok!(h.engine.stop_strategy(&strategy.id)).stopped);
    assert_eq!(h.engine.engine_status().active_strategy_count, 0);
    assert_eq!(
        h.store.get_strategy(&strategy.id).unwrap().unwrap().status,
        StrategyStatus::Stopped
    );
}

#[test]
fn test_unknown_and_ownerless_strategies() {
    let h = harness(Behaviour::Accept);
    assert!(matches!(
        h.engine.start_strategy("missing"),
        Err(EngineError::NotFound(_))
    ));

    let orphan = short_call("", "NIFTY");
    h.store.save_strategy(&orphan).unwrap();
    assert!(matches!(
        h.engine.start_strategy(&orphan.id),
        Err(EngineError::InternalInvariant(_))
    ));
    assert!(matches!(
        h.engine.stop_strategy(&orphan.id),
        Err(EngineError::InternalInvariant(_))
    ));
    assert_eq!(
        h.store.get_strategy(&orphan.id).unwrap().unwrap().status,
        StrategyStatus::Draft
    );
}

#[test]
fn test_completed_strategy_cannot_restart() {
    let h = harness(Behaviour::Accept);
    connect(&h.store, "user-1");
    let mut strategy = short_call("user-1", "NIFTY");
    strategy.status = StrategyStatus::Completed;
    h.store.save_strategy(&strategy).unwrap();

    assert!(matches!(
        h.engine.start_strategy(&strategy.id),
        Err(EngineError::Validation(_))
    ));
    // Stopping leaves the terminal status alone
    assert_ok!(h.engine.stop_strategy(&strategy.id));
    assert_eq!(
        h.store.get_strategy(&strategy.id).unwrap().unwrap().status,
        StrategyStatus::Completed
    );
}

#[test]
fn test_invalid_price_update() {
    let h = harness(Behaviour::Accept);
    assert_err!(h.engine.update_price("NIFTY", 0.0));
    assert_err!(h.engine.update_price("NIFTY", f64::NAN));
    assert_ok!(h.engine.update_price("NIFTY", 22_010.5));
}

// =============================================================================
// Scheduling & dispatch
// =============================================================================

#[tokio::test]
async fn test_tick_enters_then_squares_off() {
    let h = harness(Behaviour::Accept);
    connect(&h.store, "user-1");
    let monday = next_monday();
    let expiry = weekly_expiry(monday.and_hms_opt(10, 0, 0).unwrap());
    list_call(&h.store, "NIFTY", 22_000.0, expiry);

    let strategy = short_call("user-1", "NIFTY");
    h.store.save_strategy(&strategy).unwrap();
    h.engine.start_strategy(&strategy.id).unwrap();
    h.engine.update_price("NIFTY", 22_010.0).unwrap();

    let entry = h.engine.tick(local(monday, 10, 0));
    assert_eq!(entry.evaluated, 1);
    assert_eq!(entry.orders_enqueued, 1);
    assert_eq!(entry.failures, 0);
    assert_eq!(h.engine.engine_status().pending_orders, 1);

    // Entered today: nothing is due until square-off
    let idle = h.engine.tick(local(monday, 11, 0));
    assert_eq!(idle.evaluated, 0);

    let exit = h.engine.tick(local(monday, 15, 20));
    assert_eq!(exit.evaluated, 1);
    assert_eq!(exit.orders_enqueued, 1);

    drain(&h.engine).await;
    drain(&h.engine).await;
    let placed = h.broker.placed();
    assert_eq!(placed.len(), 2);
    assert_eq!(placed[0].transaction_type, Some(OrderSide::Sell));
    assert_eq!(placed[1].transaction_type, Some(OrderSide::Buy));
    assert_eq!(placed[0].security_id, placed[1].security_id);
    assert_eq!(placed[0].security_id, "NIFTY22000");

    let orders = h.engine.orders_for_user("user-1", 10).unwrap();
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|o| o.status == OrderStatus::Filled));
    assert_eq!(orders.iter().filter(|o| o.context.is_exit).count(), 1);

    let trades = h.store.trades_for_strategy(&strategy.id).unwrap();
    assert_eq!(trades.len(), 2);
    let exit_trade = trades.iter().find(|t| t.is_exit).unwrap();
    assert_eq!(exit_trade.exit_condition.as_deref(), Some("Square-off at 15:20"));

    let reloaded = h.store.get_strategy(&strategy.id).unwrap().unwrap();
    assert!(reloaded.last_run_at.is_some());
}

#[tokio::test]
async fn test_failing_strategy_does_not_stop_tick() {
    let h = harness(Behaviour::Accept);
    connect(&h.store, "user-1");
    connect(&h.store, "user-2");
    let monday = next_monday();
    let expiry = weekly_expiry(monday.and_hms_opt(10, 0, 0).unwrap());
    list_call(&h.store, "NIFTY", 22_000.0, expiry);

    let healthy = short_call("user-1", "NIFTY");
    // No BANKNIFTY contracts are listed
    let broken = short_call("user-2", "BANKNIFTY");
    for strategy in [&healthy, &broken] {
        h.store.save_strategy(strategy).unwrap();
        h.engine.start_strategy(&strategy.id).unwrap();
    }
    h.engine.update_price("NIFTY", 21_990.0).unwrap();
    h.engine.update_price("BANKNIFTY", 47_120.0).unwrap();

    let summary = h.engine.tick(local(monday, 10, 0));
    assert_eq!(summary.evaluated, 2);
    assert_eq!(summary.orders_enqueued, 1);
    assert_eq!(summary.failures, 1);
    assert_eq!(h.engine.engine_status().active_strategy_count, 2);
    assert_eq!(h.engine.dispatcher().pending("user-1"), 1);
    assert_eq!(h.engine.dispatcher().pending("user-2"), 0);
}

#[tokio::test]
async fn test_paused_strategy_is_skipped() {
    let h = harness(Behaviour::Accept);
    connect(&h.store, "user-1");
    let strategy = short_call("user-1", "NIFTY");
    h.store.save_strategy(&strategy).unwrap();
    h.engine.start_strategy(&strategy.id).unwrap();
    h.engine.update_price("NIFTY", 22_000.0).unwrap();

    h.engine.pause_strategy(&strategy.id).unwrap();
    assert_eq!(h.engine.tick(local(next_monday(), 10, 0)).evaluated, 0);
    assert_eq!(
        h.store.get_strategy(&strategy.id).unwrap().unwrap().status,
        StrategyStatus::Paused
    );

    h.engine.resume_strategy(&strategy.id).unwrap();
    assert_eq!(h.engine.active_strategies("user-1").len(), 1);
    assert!(h.engine.active_strategies("user-1")[0].is_active);
}

#[tokio::test]
async fn test_slow_broker_only_delays_its_user() {
    let gate = Arc::new(Notify::new());
    let h = harness(Behaviour::Block(gate.clone()));
    let fast = MockBroker::new(Behaviour::Accept);
    let dispatcher = h.engine.dispatcher();

    dispatcher.enqueue(queued("slow-user"), h.broker.clone());
    dispatcher.enqueue(queued("slow-user"), h.broker.clone());
    dispatcher.enqueue(queued("fast-user"), fast.clone());

    let first = dispatcher.drain_cycle();
    assert_eq!(first.len(), 2);

    let mut settled = false;
    for _ in 0..100 {
        if h.store.orders_for_user("fast-user", 10).unwrap().len() == 1 {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(settled, "fast user's order should not wait for the slow broker");
    assert!(h.store.orders_for_user("slow-user", 10).unwrap().is_empty());

    // The slow lane is still busy, so its second order stays queued
    assert!(dispatcher.drain_cycle().is_empty());
    assert_eq!(dispatcher.pending("slow-user"), 1);

    gate.notify_one();
    for handle in first {
        handle.await.unwrap();
    }
    assert_eq!(h.store.orders_for_user("slow-user", 10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_auth_failure_disconnects_broker() {
    let h = harness(Behaviour::Expired);
    connect(&h.store, "user-1");
    let order = queued("user-1");
    h.engine.dispatcher().enqueue(order.clone(), h.broker.clone());
    drain(&h.engine).await;

    let record = h.store.get_order(&order.id).unwrap().unwrap();
    assert_eq!(record.status, OrderStatus::Failed);
    assert_eq!(record.error_code.as_deref(), Some("authentication"));

    let connection = h
        .store
        .get_broker_connection("user-1", BrokerKind::Dhan)
        .unwrap()
        .unwrap();
    assert!(!connection.is_connected);
    assert!(connection.last_error.is_some());

    // Retrying needs a healthy connection
    assert!(matches!(
        h.engine.requeue_order(&order.id),
        Err(EngineError::NoBrokerConnection { .. })
    ));
}

#[tokio::test]
async fn test_connected_users_follow_registered_strategies() {
    let h = harness(Behaviour::Accept);
    connect(&h.store, "user-1");
    let monday = next_monday();
    let expiry = weekly_expiry(monday.and_hms_opt(10, 0, 0).unwrap());
    list_call(&h.store, "NIFTY", 22_000.0, expiry);

    let first = short_call("user-1", "NIFTY");
    let second = short_call("user-1", "NIFTY");
    for strategy in [&first, &second] {
        h.store.save_strategy(strategy).unwrap();
    }
    assert_eq!(h.engine.engine_status().connected_user_count, 0);

    // Counted as soon as a strategy is registered, before any order is queued
    h.engine.start_strategy(&first.id).unwrap();
    assert_eq!(h.engine.engine_status().connected_user_count, 1);
    h.engine.start_strategy(&second.id).unwrap();
    assert_eq!(h.engine.engine_status().connected_user_count, 1);

    h.engine.update_price("NIFTY", 22_010.0).unwrap();
    assert_eq!(h.engine.tick(local(monday, 10, 0)).orders_enqueued, 2);
    drain(&h.engine).await;
    drain(&h.engine).await;
    assert_eq!(h.engine.dispatcher().lane_count(), 1);

    h.engine.stop_strategy(&first.id).unwrap();
    assert_eq!(h.engine.engine_status().connected_user_count, 1);
    assert_eq!(h.engine.dispatcher().lane_count(), 1);

    h.engine.stop_strategy(&second.id).unwrap();
    let status = h.engine.engine_status();
    assert_eq!(status.active_strategy_count, 0);
    assert_eq!(status.connected_user_count, 0);
    assert_eq!(h.engine.dispatcher().lane_count(), 0);
}

#[tokio::test]
async fn test_orders_reach_the_strategy_broker() {
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());
    let dhan = MockBroker::on(BrokerKind::Dhan, Behaviour::Accept);
    let angel_one = MockBroker::on(BrokerKind::AngelOne, Behaviour::Accept);
    let engine = Arc::new(TradingEngine::new(
        &Config::default(),
        store.clone(),
        Arc::new(PerBrokerFactory {
            dhan: dhan.clone(),
            angel_one: angel_one.clone(),
        }),
    ));
    connect_to(&store, "user-1", BrokerKind::Dhan);
    connect_to(&store, "user-1", BrokerKind::AngelOne);
    let monday = next_monday();
    let expiry = weekly_expiry(monday.and_hms_opt(10, 0, 0).unwrap());
    list_call(&store, "NIFTY", 22_000.0, expiry);

    let on_dhan = short_call("user-1", "NIFTY");
    let mut on_angel = short_call("user-1", "NIFTY");
    on_angel.broker = BrokerKind::AngelOne;
    for strategy in [&on_dhan, &on_angel] {
        store.save_strategy(strategy).unwrap();
        engine.start_strategy(&strategy.id).unwrap();
    }
    engine.update_price("NIFTY", 22_010.0).unwrap();

    assert_eq!(engine.tick(local(monday, 10, 0)).orders_enqueued, 2);
    // One user, one lane: the two orders go out on consecutive cycles
    assert_eq!(engine.dispatcher().lane_count(), 1);
    drain(&engine).await;
    drain(&engine).await;

    assert_eq!(dhan.placed().len(), 1);
    assert_eq!(angel_one.placed().len(), 1);
    assert_eq!(dhan.placed()[0].security_id, "NIFTY22000");
    assert_eq!(angel_one.placed()[0].security_id, "NIFTY22000");

    let orders = engine.orders_for_user("user-1", 10).unwrap();
    assert_eq!(orders.len(), 2);
    for order in &orders {
        let expected = if order.strategy_id == on_dhan.id {
            BrokerKind::Dhan
        } else {
            BrokerKind::AngelOne
        };
        assert_eq!(order.broker, expected);
        assert!(order
            .broker_order_id
            .as_deref()
            .unwrap()
            .starts_with(&expected.to_string()));
    }
    assert_eq!(engine.engine_status().connected_user_count, 1);
}

#[tokio::test]
async fn test_spawn_restores_active_strategies() {
    let h = harness(Behaviour::Accept);
    connect(&h.store, "user-1");
    let mut strategy = short_call("user-1", "NIFTY");
    strategy.status = StrategyStatus::Active;
    h.store.save_strategy(&strategy).unwrap();

    let handle = h.engine.spawn();
    let status = h.engine.engine_status();
    assert!(status.running);
    assert_eq!(status.active_strategy_count, 1);

    handle.shutdown().await;
    assert!(!h.engine.engine_status().running);
}
