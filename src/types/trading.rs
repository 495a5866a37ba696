//! Trading Types
//!
//! Broker-neutral order specifications plus the order and trade records the
//! dispatcher persists for every submission attempt.

use serde::{Deserialize, Serialize};

use super::BrokerKind;

// =============================================================================
// Enums
// =============================================================================

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    /// Stop-loss limit
    StopLoss,
    /// Stop-loss market
    StopLossMarket,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "market"),
            OrderType::Limit => write!(f, "limit"),
            OrderType::StopLoss => write!(f, "stop_loss"),
            OrderType::StopLossMarket => write!(f, "stop_loss_market"),
        }
    }
}

/// Product type (margin treatment) of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    Intraday,
    /// Carry-forward derivatives position
    Margin,
    Delivery,
}

/// Exchange segment an instrument trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeSegment {
    NseEq,
    NseFno,
    BseEq,
    BseFno,
}

impl ExchangeSegment {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "nse_eq" => Some(ExchangeSegment::NseEq),
            "nse_fno" => Some(ExchangeSegment::NseFno),
            "bse_eq" => Some(ExchangeSegment::BseEq),
            "bse_fno" => Some(ExchangeSegment::BseFno),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExchangeSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeSegment::NseEq => write!(f, "nse_eq"),
            ExchangeSegment::NseFno => write!(f, "nse_fno"),
            ExchangeSegment::BseEq => write!(f, "bse_eq"),
            ExchangeSegment::BseFno => write!(f, "bse_fno"),
        }
    }
}

/// Lifecycle of a submitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Waiting in the user's dispatch lane
    Queued,
    /// Accepted by the broker, not yet filled
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    /// Rejected by the broker
    Rejected,
    /// Never reached the broker (validation, transport, timeout)
    Failed,
}

impl OrderStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(OrderStatus::Queued),
            "open" => Some(OrderStatus::Open),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "rejected" => Some(OrderStatus::Rejected),
            "failed" => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, OrderStatus::Rejected | OrderStatus::Failed)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Queued => write!(f, "queued"),
            OrderStatus::Open => write!(f, "open"),
            OrderStatus::PartiallyFilled => write!(f, "partially_filled"),
            OrderStatus::Filled => write!(f, "filled"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
            OrderStatus::Rejected => write!(f, "rejected"),
            OrderStatus::Failed => write!(f, "failed"),
        }
    }
}

// =============================================================================
// Order Specification
// =============================================================================

/// Broker-neutral order request.
///
/// Enum fields may be absent on the wire; adapters validate them before any
/// network call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_type: Option<OrderSide>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_segment: Option<ExchangeSegment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_type: Option<ProductType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_type: Option<OrderType>,
    pub security_id: String,
    pub trading_symbol: String,
    pub quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_price: Option<f64>,
    /// Client tag echoed back by brokers that support it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl OrderSpec {
    /// Intraday market order.
    pub fn market(
        side: OrderSide,
        segment: ExchangeSegment,
        security_id: String,
        trading_symbol: String,
        quantity: i64,
    ) -> Self {
        Self {
            transaction_type: Some(side),
            exchange_segment: Some(segment),
            product_type: Some(ProductType::Intraday),
            order_type: Some(OrderType::Market),
            security_id,
            trading_symbol,
            quantity,
            price: None,
            trigger_price: None,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: String) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

/// Strategy context carried alongside an order into the trade ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeContext {
    /// What produced the order, e.g. a leg description or condition list
    pub entry_condition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Underlying/reference price at evaluation time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_price: Option<f64>,
    #[serde(default)]
    pub is_exit: bool,
}

/// An order waiting in a user's dispatch lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOrder {
    pub id: String,
    pub user_id: String,
    pub strategy_id: String,
    pub spec: OrderSpec,
    pub context: TradeContext,
    pub enqueued_at: i64,
}

impl QueuedOrder {
    pub fn new(user_id: String, strategy_id: String, spec: OrderSpec, context: TradeContext) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            spec: spec.with_correlation_id(id.chars().take(20).collect()),
            id,
            user_id,
            strategy_id,
            context,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

// =============================================================================
// Persisted Records
// =============================================================================

/// One broker submission attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub id: String,
    pub user_id: String,
    pub strategy_id: String,
    pub broker: BrokerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker_order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub spec: OrderSpec,
    pub context: TradeContext,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Ledger entry carrying strategy context for a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub id: String,
    pub order_id: String,
    pub user_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub entry_condition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub is_exit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub created_at: i64,
}

impl TradeRecord {
    /// Build the ledger entry for an order record.
    pub fn from_order(order: &OrderRecord) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            order_id: order.id.clone(),
            user_id: order.user_id.clone(),
            strategy_id: order.strategy_id.clone(),
            symbol: order.spec.trading_symbol.clone(),
            side: order.spec.transaction_type.unwrap_or(OrderSide::Buy),
            quantity: order.spec.quantity,
            price: order.average_price.or(order.spec.price),
            status: order.status,
            entry_condition: order.context.entry_condition.clone(),
            exit_condition: order.context.exit_condition.clone(),
            stop_loss: order.context.stop_loss.clone(),
            target: order.context.target.clone(),
            is_exit: order.context.is_exit,
            realized_pnl: None,
            error_code: order.error_code.clone(),
            created_at: order.created_at,
        }
    }
}
