pub mod backtester;
pub mod dispatcher;
pub mod engine;
pub mod performance;
pub mod pricing;
pub mod registry;
pub mod scheduler;
pub mod sqlite_store;
pub mod strategy_engine;

pub use backtester::BacktestSimulator;
pub use dispatcher::OrderDispatcher;
pub use engine::{EngineHandle, EngineStatus, StartOutcome, StopOutcome, TradingEngine};
pub use performance::{sharpe_ratio, PerformanceTracker};
pub use pricing::{OptionQuote, PricingModel, TransactionCosts};
pub use registry::{ActiveStrategyInfo, RegistryError, ScheduleState, StrategyRegistry};
pub use scheduler::{Scheduler, TickSummary};
pub use sqlite_store::SqliteStore;
pub use strategy_engine::{Evaluation, StrategyEngine};
