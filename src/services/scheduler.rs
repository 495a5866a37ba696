//! Scheduler
//!
//! Fixed-interval tick that evaluates due strategies, hands their orders to
//! the dispatcher and advances each strategy's `next_run`.

use crate::services::{OrderDispatcher, ScheduleState, SqliteStore, StrategyEngine, StrategyRegistry};
use crate::types::{exchange_offset, exchange_timestamp_ms, Strategy};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Current exchange-local time.
pub fn exchange_now() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&exchange_offset())
}

/// When a strategy should next be evaluated after a run at `now`.
pub fn next_run_after(
    strategy: &Strategy,
    state: &ScheduleState,
    now: DateTime<FixedOffset>,
    interval: Duration,
) -> i64 {
    let local = now.naive_local();
    let today = local.date();
    let now_ms = now.timestamp_millis();
    let step = interval.as_millis() as i64;

    if strategy.trades_on(today.weekday()) {
        if local.time() < strategy.start_time {
            return exchange_timestamp_ms(today, strategy.start_time);
        }
        if local.time() < strategy.square_off_time {
            if state.holds_position(today) {
                return exchange_timestamp_ms(today, strategy.square_off_time);
            }
            return now_ms + step;
        }
    }

    (1..=7)
        .map(|offset| today + ChronoDuration::days(offset))
        .find(|day| strategy.trades_on(day.weekday()))
        .map(|day| exchange_timestamp_ms(day, strategy.start_time))
        .unwrap_or(now_ms + ChronoDuration::days(1).num_milliseconds())
}

/// Outcome of one scheduler tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub evaluated: usize,
    pub orders_enqueued: usize,
    pub failures: usize,
}

pub struct Scheduler {
    registry: Arc<StrategyRegistry>,
    engine: Arc<StrategyEngine>,
    dispatcher: Arc<OrderDispatcher>,
    store: Arc<SqliteStore>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        engine: Arc<StrategyEngine>,
        dispatcher: Arc<OrderDispatcher>,
        store: Arc<SqliteStore>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            engine,
            dispatcher,
            store,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Evaluate every due strategy once. A failing strategy never stops the tick.
    pub fn tick(&self, now: DateTime<FixedOffset>) -> TickSummary {
        let now_ms = now.timestamp_millis();
        let mut summary = TickSummary::default();

        for strategy_id in self.registry.due(now_ms) {
            let Some(running) = self.registry.snapshot(&strategy_id) else {
                continue;
            };
            summary.evaluated += 1;

            let mut state = match self.engine.evaluate(&running, now) {
                Ok(evaluation) => {
                    summary.orders_enqueued += evaluation.orders.len();
                    for order in evaluation.orders {
                        self.dispatcher.enqueue(order, running.adapter.clone());
                    }
                    evaluation.state
                }
                Err(e) => {
                    warn!("Strategy {} evaluation failed: {}", strategy_id, e);
                    summary.failures += 1;
                    let mut state = running.state.clone();
                    state.last_run = Some(now_ms);
                    state
                }
            };

            state.next_run = next_run_after(&running.strategy, &state, now, self.interval);
            debug!("Strategy {} next run at {}", strategy_id, state.next_run);
            if !self.registry.update_state(&strategy_id, state) {
                debug!("Strategy {} was stopped during evaluation", strategy_id);
                continue;
            }
            if let Err(e) = self.store.set_last_run_at(&strategy_id, now_ms) {
                error!("Failed to record last run for {}: {}", strategy_id, e);
            }
        }

        // Lanes of users who stopped everything while orders were in flight
        self.dispatcher.prune_idle(&self.registry.owners());

        if summary.evaluated > 0 {
            debug!(
                "Scheduler tick: {} evaluated, {} orders, {} failures",
                summary.evaluated, summary.orders_enqueued, summary.failures
            );
        }
        summary
    }

    /// Tick on a fixed interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Scheduler started ({}s tick)", self.interval.as_secs());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Store writes block, keep them off the async workers
                    let scheduler = Arc::clone(&self);
                    let ticked = tokio::task::spawn_blocking(move || scheduler.tick(exchange_now())).await;
                    if let Err(e) = ticked {
                        error!("Scheduler tick failed: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Scheduler stopping");
                    break;
                }
            }
        }
    }
}
