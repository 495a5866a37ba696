//! Trading Engine
//!
//! Lifecycle object owned by the process entry point. Wires the registry,
//! scheduler, dispatcher and backtest simulator together and exposes the
//! operations the HTTP layer routes to.

use crate::brokers::{BrokerAdapter, BrokerFactory};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::services::registry::{ActiveStrategyInfo, RegistryError, ScheduleState};
use crate::services::scheduler::{exchange_now, next_run_after, Scheduler, TickSummary};
use crate::services::{
    BacktestSimulator, OrderDispatcher, PerformanceTracker, PricingModel, SqliteStore,
    StrategyEngine, StrategyRegistry,
};
use crate::types::{
    BacktestPeriod, BacktestResult, BrokerKind, OrderRecord, PerformanceMetrics, QueuedOrder,
    Strategy, StrategyStatus,
};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Engine-wide counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub running: bool,
    pub active_strategy_count: usize,
    /// Users with at least one registered strategy
    pub connected_user_count: usize,
    pub pending_orders: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub activated: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub stopped: bool,
}

pub struct TradingEngine {
    store: Arc<SqliteStore>,
    brokers: Arc<dyn BrokerFactory>,
    registry: Arc<StrategyRegistry>,
    evaluator: Arc<StrategyEngine>,
    dispatcher: Arc<OrderDispatcher>,
    scheduler: Arc<Scheduler>,
    simulator: BacktestSimulator,
    dispatch_interval: Duration,
    restore_on_spawn: bool,
    running: AtomicBool,
}

impl TradingEngine {
    pub fn new(config: &Config, store: Arc<SqliteStore>, brokers: Arc<dyn BrokerFactory>) -> Self {
        let registry = Arc::new(StrategyRegistry::new());
        let evaluator = Arc::new(StrategyEngine::new(store.clone()));
        let dispatcher = Arc::new(OrderDispatcher::new(store.clone(), config.broker.timeout()));
        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            evaluator.clone(),
            dispatcher.clone(),
            store.clone(),
            config.scheduler_interval(),
        ));
        let simulator = BacktestSimulator::new(store.clone(), PricingModel::new(config.default_volatility));

        Self {
            store,
            brokers,
            registry,
            evaluator,
            dispatcher,
            scheduler,
            simulator,
            dispatch_interval: config.dispatch_interval(),
            restore_on_spawn: config.restore_active_on_startup,
            running: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<OrderDispatcher> {
        &self.dispatcher
    }

    // ========== Lookups ==========

    fn load_strategy(&self, strategy_id: &str) -> EngineResult<Strategy> {
        let strategy = self
            .store
            .get_strategy(strategy_id)?
            .ok_or_else(|| EngineError::NotFound(format!("strategy {}", strategy_id)))?;
        if strategy.owner_id.trim().is_empty() {
            error!("Strategy {} has no owner id", strategy.id);
            return Err(EngineError::InternalInvariant(format!(
                "strategy {} has no owner id",
                strategy.id
            )));
        }
        Ok(strategy)
    }

    /// Adapter for a user's connected broker account.
    fn connect(&self, user_id: &str, broker: BrokerKind) -> EngineResult<Arc<dyn BrokerAdapter>> {
        let no_connection = || EngineError::NoBrokerConnection {
            user_id: user_id.to_string(),
            broker,
        };
        let connection = self
            .store
            .get_broker_connection(user_id, broker)?
            .filter(|c| c.is_connected)
            .ok_or_else(no_connection)?;
        self.brokers.connect(&connection).map_err(|e| {
            warn!("Cannot build {} adapter for {}: {}", broker, user_id, e);
            no_connection()
        })
    }

    fn set_status(&self, strategy_id: &str, status: StrategyStatus) -> EngineResult<()> {
        if !self.store.update_strategy_status(strategy_id, status)? {
            return Err(EngineError::NotFound(format!("strategy {}", strategy_id)));
        }
        Ok(())
    }

    // ========== Lifecycle ==========

    /// Register a strategy for live evaluation. Starting an active strategy succeeds.
    pub fn start_strategy(&self, strategy_id: &str) -> EngineResult<StartOutcome> {
        let strategy = self.load_strategy(strategy_id)?;
        if self.registry.contains(strategy_id) {
            debug!("Strategy {} already active", strategy_id);
            self.set_status(strategy_id, StrategyStatus::Active)?;
            self.registry
                .set_paused(strategy_id, false)
                .map_err(|e| EngineError::InternalInvariant(e.to_string()))?;
            return Ok(StartOutcome { activated: true });
        }
        if !strategy.status.can_start() && strategy.status != StrategyStatus::Paused {
            return Err(EngineError::Validation(format!(
                "strategy {} is completed and cannot be started",
                strategy_id
            )));
        }
        strategy.validate().map_err(EngineError::Validation)?;

        let adapter = self.connect(&strategy.owner_id, strategy.broker)?;
        let next_run = next_run_after(
            &strategy,
            &ScheduleState::default(),
            exchange_now(),
            self.scheduler.interval(),
        );
        let name = strategy.name.clone();
        match self.registry.add(strategy, adapter, next_run) {
            Ok(()) => info!("Strategy {} ({}) activated", strategy_id, name),
            Err(RegistryError::AlreadyActive(_)) => debug!("Strategy {} raced to active", strategy_id),
            Err(e) => return Err(EngineError::InternalInvariant(e.to_string())),
        }
        self.set_status(strategy_id, StrategyStatus::Active)?;
        Ok(StartOutcome { activated: true })
    }

    /// Remove a strategy from live evaluation. Stopping a stopped strategy succeeds.
    ///
    /// Orders already handed to the dispatcher are not cancelled.
    pub fn stop_strategy(&self, strategy_id: &str) -> EngineResult<StopOutcome> {
        let strategy = self.load_strategy(strategy_id)?;
        match self.registry.remove(strategy_id) {
            Ok(_) => {
                info!("Strategy {} stopped", strategy_id);
                self.dispatcher.prune_idle(&self.registry.owners());
            }
            Err(RegistryError::NotActive(_)) => debug!("Strategy {} was not active", strategy_id),
            Err(e) => return Err(EngineError::InternalInvariant(e.to_string())),
        }
        if strategy.status != StrategyStatus::Completed {
            self.set_status(strategy_id, StrategyStatus::Stopped)?;
        }
        Ok(StopOutcome { stopped: true })
    }

    pub fn pause_strategy(&self, strategy_id: &str) -> EngineResult<()> {
        self.load_strategy(strategy_id)?;
        self.registry
            .set_paused(strategy_id, true)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        self.set_status(strategy_id, StrategyStatus::Paused)?;
        info!("Strategy {} paused", strategy_id);
        Ok(())
    }

    /// Resume a paused strategy, registering it again when it is not loaded.
    pub fn resume_strategy(&self, strategy_id: &str) -> EngineResult<()> {
        if !self.registry.contains(strategy_id) {
            self.start_strategy(strategy_id)?;
            return Ok(());
        }
        self.load_strategy(strategy_id)?;
        self.registry
            .set_paused(strategy_id, false)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        self.set_status(strategy_id, StrategyStatus::Active)?;
        info!("Strategy {} resumed", strategy_id);
        Ok(())
    }

    /// Re-register strategies persisted as active. Returns how many were restored.
    pub fn restore_active(&self) -> EngineResult<usize> {
        let mut restored = 0;
        for strategy in self.store.strategies_with_status(StrategyStatus::Active)? {
            match self.start_strategy(&strategy.id) {
                Ok(_) => restored += 1,
                Err(e) => warn!("Could not restore strategy {}: {}", strategy.id, e),
            }
        }
        info!("Restored {} active strategies", restored);
        Ok(restored)
    }

    // ========== Backtests ==========

    pub fn run_backtest(
        &self,
        strategy_id: &str,
        period: &str,
        initial_capital: f64,
    ) -> EngineResult<BacktestResult> {
        let period = BacktestPeriod::parse(period).ok_or_else(|| {
            EngineError::Validation(format!("unknown backtest period '{}'", period))
        })?;
        let strategy = self.load_strategy(strategy_id)?;
        self.simulator.run(&strategy, period, initial_capital)
    }

    pub fn backtest_results(&self, strategy_id: &str) -> EngineResult<Vec<BacktestResult>> {
        self.load_strategy(strategy_id)?;
        Ok(self.store.backtest_results(strategy_id)?)
    }

    // ========== Reporting ==========

    pub fn engine_status(&self) -> EngineStatus {
        EngineStatus {
            running: self.running.load(Ordering::Acquire),
            active_strategy_count: self.registry.len(),
            connected_user_count: self.registry.owners().len(),
            pending_orders: self.dispatcher.total_pending(),
        }
    }

    pub fn active_strategies(&self, user_id: &str) -> Vec<ActiveStrategyInfo> {
        self.registry.for_owner(user_id)
    }

    /// Live performance from the persisted trade ledger.
    pub fn strategy_performance(&self, strategy_id: &str) -> EngineResult<PerformanceMetrics> {
        self.load_strategy(strategy_id)?;
        let trades = self.store.trades_for_strategy(strategy_id)?;
        Ok(PerformanceTracker::from_ledger(&trades).metrics())
    }

    pub fn orders_for_user(&self, user_id: &str, limit: usize) -> EngineResult<Vec<OrderRecord>> {
        Ok(self.store.orders_for_user(user_id, limit)?)
    }

    // ========== Orders & Prices ==========

    pub fn update_price(&self, symbol: &str, price: f64) -> EngineResult<()> {
        if !price.is_finite() || price <= 0.0 {
            return Err(EngineError::Validation(format!("invalid price {} for {}", price, symbol)));
        }
        self.evaluator.update_price(symbol, price);
        Ok(())
    }

    /// Explicit retry of a failed submission.
    pub fn requeue_order(&self, order_id: &str) -> EngineResult<QueuedOrder> {
        let order = self
            .store
            .get_order(order_id)?
            .ok_or_else(|| EngineError::NotFound(format!("order {}", order_id)))?;
        let adapter = self.connect(&order.user_id, order.broker)?;
        self.dispatcher.requeue(order_id, adapter)
    }

    /// Run one scheduler tick at `now`.
    pub fn tick(&self, now: DateTime<FixedOffset>) -> TickSummary {
        self.scheduler.tick(now)
    }

    // ========== Runtime ==========

    /// Start the scheduler and dispatch loops.
    pub fn spawn(self: &Arc<Self>) -> EngineHandle {
        if self.restore_on_spawn {
            if let Err(e) = self.restore_active() {
                error!("Failed to restore active strategies: {}", e);
            }
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let scheduler = self.scheduler.clone();
        let dispatcher = self.dispatcher.clone();
        let tasks = vec![
            tokio::spawn(scheduler.run(shutdown_tx.subscribe())),
            tokio::spawn(dispatcher.run(self.dispatch_interval, shutdown_tx.subscribe())),
        ];
        self.running.store(true, Ordering::Release);
        info!("Trading engine running");

        EngineHandle {
            engine: self.clone(),
            shutdown_tx,
            tasks,
        }
    }
}

/// Handle to the running engine loops.
pub struct EngineHandle {
    engine: Arc<TradingEngine>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Signal both loops and wait for them to exit.
    pub async fn shutdown(self) {
        if self.shutdown_tx.send(()).is_err() {
            debug!("Engine loops already stopped");
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Engine task ended abnormally: {}", e);
            }
        }
        self.engine.running.store(false, Ordering::Release);
        info!("Trading engine stopped");
    }
}
