//! Order Dispatcher
//!
//! One FIFO lane per user. Each drain cycle pops at most one order per lane
//! and submits it on its own task, so a slow broker only delays its own user.

use crate::brokers::{BrokerAdapter, BrokerError};
use crate::error::{EngineError, EngineResult};
use crate::services::SqliteStore;
use crate::types::{OrderRecord, OrderStatus, QueuedOrder, TradeRecord};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// An order waiting for submission through the adapter it was queued with.
type Pending = (QueuedOrder, Arc<dyn BrokerAdapter>);

/// Per-user submission lane.
#[derive(Default)]
struct UserLane {
    queue: Mutex<VecDeque<Pending>>,
    in_flight: AtomicBool,
}

impl UserLane {
    fn push(&self, order: QueuedOrder, adapter: Arc<dyn BrokerAdapter>) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back((order, adapter));
    }

    fn pop(&self) -> Option<Pending> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn is_idle(&self) -> bool {
        !self.in_flight.load(Ordering::Acquire) && self.pending() == 0
    }
}

/// Queues and submits orders to brokers.
pub struct OrderDispatcher {
    store: Arc<SqliteStore>,
    lanes: DashMap<String, Arc<UserLane>>,
    /// Upper bound on one submission, on top of the adapter's own timeout
    submit_timeout: Duration,
}

impl OrderDispatcher {
    pub fn new(store: Arc<SqliteStore>, submit_timeout: Duration) -> Self {
        Self {
            store,
            lanes: DashMap::new(),
            submit_timeout,
        }
    }

    /// Append an order to its user's lane. It is submitted through `adapter`
    /// even when the same user queues orders for another broker.
    pub fn enqueue(&self, order: QueuedOrder, adapter: Arc<dyn BrokerAdapter>) {
        debug!(
            "Queued order {} for user {} on {} ({})",
            order.id,
            order.user_id,
            adapter.kind(),
            order.spec.trading_symbol
        );
        // Push under the map guard so a concurrent prune cannot drop the lane first
        self.lanes
            .entry(order.user_id.clone())
            .or_default()
            .push(order, adapter);
    }

    /// Users with a lane, idle or not.
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Drop idle lanes whose user is not in `keep`. Returns how many were removed.
    pub fn prune_idle(&self, keep: &HashSet<String>) -> usize {
        let before = self.lanes.len();
        self.lanes
            .retain(|user_id, lane| keep.contains(user_id) || !lane.is_idle());
        let removed = before.saturating_sub(self.lanes.len());
        if removed > 0 {
            debug!("Pruned {} idle dispatch lanes", removed);
        }
        removed
    }

    pub fn pending(&self, user_id: &str) -> usize {
        self.lanes.get(user_id).map(|lane| lane.pending()).unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.lanes.iter().map(|lane| lane.pending()).sum()
    }

    /// Pop one order per idle lane and submit each on its own task.
    pub fn drain_cycle(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let lanes: Vec<Arc<UserLane>> = self.lanes.iter().map(|e| e.value().clone()).collect();
        let mut handles = Vec::new();
        for lane in lanes {
            if lane
                .in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let Some((order, adapter)) = lane.pop() else {
                lane.in_flight.store(false, Ordering::Release);
                continue;
            };
            let dispatcher = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                dispatcher.submit(order, adapter).await;
                lane.in_flight.store(false, Ordering::Release);
            }));
        }
        handles
    }

    /// Drain lanes on a fixed interval until shutdown.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Order dispatcher started ({}s cycle)", period.as_secs());
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let started = self.drain_cycle().len();
                    if started > 0 {
                        debug!("Dispatch cycle started {} submissions", started);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Order dispatcher stopping");
                    break;
                }
            }
        }
    }

    /// Submit one order and persist the attempt.
    pub async fn submit(&self, order: QueuedOrder, adapter: Arc<dyn BrokerAdapter>) -> OrderRecord {
        let outcome = match tokio::time::timeout(self.submit_timeout, adapter.place_order(&order.spec)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout),
        };

        let now = Utc::now().timestamp_millis();
        let mut record = OrderRecord {
            id: order.id.clone(),
            user_id: order.user_id.clone(),
            strategy_id: order.strategy_id.clone(),
            broker: adapter.kind(),
            broker_order_id: None,
            status: OrderStatus::Queued,
            filled_quantity: 0,
            average_price: None,
            error_code: None,
            error_message: None,
            spec: order.spec,
            context: order.context,
            created_at: now,
            updated_at: now,
        };

        match outcome {
            Ok(ack) => {
                info!(
                    "Order {} placed for user {}: broker id {} ({})",
                    record.id, record.user_id, ack.order_id, ack.status
                );
                record.broker_order_id = Some(ack.order_id);
                record.status = ack.status;
                if ack.status == OrderStatus::Filled {
                    record.filled_quantity = record.spec.quantity;
                }
            }
            Err(err) => {
                warn!("Order {} for user {} failed: {}", record.id, record.user_id, err);
                record.status = match &err {
                    BrokerError::Rejected { .. } => OrderStatus::Rejected,
                    _ => OrderStatus::Failed,
                };
                record.error_code = Some(err.error_code());
                record.error_message = Some(err.to_string());
                if err.is_auth() {
                    if let Err(e) =
                        self.store
                            .mark_connection_unhealthy(&record.user_id, record.broker, &err.to_string())
                    {
                        error!("Failed to mark connection unhealthy for {}: {}", record.user_id, e);
                    }
                }
            }
        }

        if let Err(e) = self.store.save_order(&record) {
            error!("Failed to persist order {}: {}", record.id, e);
        }
        if let Err(e) = self.store.save_trade(&TradeRecord::from_order(&record)) {
            error!("Failed to persist trade for order {}: {}", record.id, e);
        }
        record
    }

    /// Re-queue a failed or rejected submission under a new order id.
    pub fn requeue(&self, order_id: &str, adapter: Arc<dyn BrokerAdapter>) -> EngineResult<QueuedOrder> {
        let record = self
            .store
            .get_order(order_id)?
            .ok_or_else(|| EngineError::NotFound(format!("order {}", order_id)))?;
        if !record.status.is_failure() {
            return Err(EngineError::Validation(format!(
                "order {} is {} and cannot be requeued",
                order_id, record.status
            )));
        }
        let mut spec = record.spec;
        spec.correlation_id = None;
        let order = QueuedOrder::new(record.user_id, record.strategy_id, spec, record.context);
        info!("Requeued order {} as {}", order_id, order.id);
        self.enqueue(order.clone(), adapter);
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::BrokerResult;
    use crate::types::{
        BrokerKind, BrokerOrder, BrokerPosition, BrokerProfile, ExchangeSegment, Funds, Holding,
        OrderAck, OrderSide, OrderSpec, TradeContext,
    };
    use async_trait::async_trait;

    struct ScriptedAdapter {
        kind: BrokerKind,
        result: fn() -> BrokerResult<OrderAck>,
        placed: Mutex<Vec<String>>,
    }

    impl ScriptedAdapter {
        fn new(result: fn() -> BrokerResult<OrderAck>) -> Self {
            Self::on(BrokerKind::Dhan, result)
        }

        fn on(kind: BrokerKind, result: fn() -> BrokerResult<OrderAck>) -> Self {
            Self {
                kind,
                result,
                placed: Mutex::new(Vec::new()),
            }
        }

        fn placed(&self) -> Vec<String> {
            self.placed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerAdapter for ScriptedAdapter {
        fn kind(&self) -> BrokerKind {
            self.kind
        }
        async fn place_order(&self, spec: &OrderSpec) -> BrokerResult<OrderAck> {
            self.placed.lock().unwrap().push(spec.trading_symbol.clone());
            (self.result)()
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
                client_id: "c".to_string(),
                name: None,
            })
        }
    }

    fn accepted() -> BrokerResult<OrderAck> {
        Ok(OrderAck {
            order_id: "B-1".to_string(),
            status: OrderStatus::Open,
            raw_status: "TRANSIT".to_string(),
        })
    }

    fn rejected() -> BrokerResult<OrderAck> {
        Err(BrokerError::Rejected {
            code: "DH-906".to_string(),
            message: "insufficient funds".to_string(),
        })
    }

    fn order(user: &str) -> QueuedOrder {
        order_for(user, "RELIANCE-EQ")
    }

    fn order_for(user: &str, symbol: &str) -> QueuedOrder {
        let spec = OrderSpec::market(
            OrderSide::Buy,
            ExchangeSegment::NseEq,
            "2885".to_string(),
            symbol.to_string(),
            1,
        );
        QueuedOrder::new(user.to_string(), "s1".to_string(), spec, TradeContext::default())
    }

    fn dispatcher() -> Arc<OrderDispatcher> {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        Arc::new(OrderDispatcher::new(store, Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_drain_pops_one_per_user() {
        let dispatcher = dispatcher();
        let adapter: Arc<dyn BrokerAdapter> = Arc::new(ScriptedAdapter::new(accepted));
        dispatcher.enqueue(order("u1"), adapter.clone());
        dispatcher.enqueue(order("u1"), adapter.clone());
        dispatcher.enqueue(order("u2"), adapter.clone());
        assert_eq!(dispatcher.lane_count(), 2);

        let handles = dispatcher.drain_cycle();
        assert_eq!(handles.len(), 2);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(dispatcher.pending("u1"), 1);
        assert_eq!(dispatcher.pending("u2"), 0);
    }

    #[tokio::test]
    async fn test_rejection_is_recorded_and_requeueable() {
        let dispatcher = dispatcher();
        let adapter: Arc<dyn BrokerAdapter> = Arc::new(ScriptedAdapter::new(rejected));
        let queued = order("u1");
        let record = dispatcher.submit(queued.clone(), adapter.clone()).await;
        assert_eq!(record.status, OrderStatus::Rejected);
        assert_eq!(record.error_code.as_deref(), Some("DH-906"));

        let stored = dispatcher.store.get_order(&queued.id).unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Rejected);
        assert_eq!(dispatcher.store.trades_for_strategy("s1").unwrap().len(), 1);

        let retry = dispatcher.requeue(&queued.id, adapter).unwrap();
        assert_ne!(retry.id, queued.id);
        assert_eq!(dispatcher.pending("u1"), 1);
    }

    #[tokio::test]
    async fn test_successful_order_cannot_be_requeued() {
        let dispatcher = dispatcher();
        let adapter: Arc<dyn BrokerAdapter> = Arc::new(ScriptedAdapter::new(accepted));
        let queued = order("u1");
        let record = dispatcher.submit(queued.clone(), adapter.clone()).await;
        assert_eq!(record.broker_order_id.as_deref(), Some("B-1"));
        assert!(matches!(
            dispatcher.requeue(&queued.id, adapter),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            dispatcher.requeue("missing", Arc::new(ScriptedAdapter::new(accepted))),
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_each_order_uses_its_own_adapter() {
        let dispatcher = dispatcher();
        let dhan = Arc::new(ScriptedAdapter::on(BrokerKind::Dhan, accepted));
        let angel = Arc::new(ScriptedAdapter::on(BrokerKind::AngelOne, accepted));
        let first = order_for("u1", "NIFTY-CE");
        let second = order_for("u1", "BANKNIFTY-PE");
        dispatcher.enqueue(first.clone(), dhan.clone());
        dispatcher.enqueue(second.clone(), angel.clone());
        assert_eq!(dispatcher.lane_count(), 1);

        for _ in 0..2 {
            for handle in dispatcher.drain_cycle() {
                handle.await.unwrap();
            }
        }

        assert_eq!(dhan.placed(), vec!["NIFTY-CE".to_string()]);
        assert_eq!(angel.placed(), vec!["BANKNIFTY-PE".to_string()]);
        let stored = dispatcher.store.get_order(&first.id).unwrap().unwrap();
        assert_eq!(stored.broker, BrokerKind::Dhan);
        let stored = dispatcher.store.get_order(&second.id).unwrap().unwrap();
        assert_eq!(stored.broker, BrokerKind::AngelOne);
    }

    #[tokio::test]
    async fn test_prune_keeps_busy_and_owned_lanes() {
        let dispatcher = dispatcher();
        let adapter: Arc<dyn BrokerAdapter> = Arc::new(ScriptedAdapter::new(accepted));
        dispatcher.enqueue(order("u1"), adapter.clone());
        dispatcher.enqueue(order("u2"), adapter.clone());
        dispatcher.enqueue(order("u3"), adapter.clone());
        for handle in dispatcher.drain_cycle() {
            handle.await.unwrap();
        }
        dispatcher.enqueue(order("u2"), adapter);

        // u1 is still registered, u2 has work queued, u3 is gone and idle
        let keep: HashSet<String> = ["u1".to_string()].into_iter().collect();
        assert_eq!(dispatcher.prune_idle(&keep), 1);
        assert_eq!(dispatcher.lane_count(), 2);
        assert_eq!(dispatcher.pending("u2"), 1);

        assert_eq!(dispatcher.prune_idle(&HashSet::new()), 1);
        assert_eq!(dispatcher.lane_count(), 1);
    }
}
