//! Broker Adapters
//!
//! One capability trait for order routing plus the AngelOne and Dhan REST
//! implementations. Adding a broker means adding an adapter and a
//! [`BrokerKind`] variant.

pub mod angel_one;
pub mod dhan;

pub use angel_one::AngelOneAdapter;
pub use dhan::DhanAdapter;

use crate::config::BrokerConfig;
use crate::types::{
    BrokerConnection, BrokerKind, BrokerOrder, BrokerPosition, BrokerProfile, ExchangeSegment,
    Funds, Holding, OrderAck, OrderSide, OrderSpec, OrderType, ProductType,
};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors surfaced by broker adapters.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Order failed local validation; nothing was sent.
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },
    /// Network or HTTP-level failure.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("broker request timed out")]
    Timeout,
    /// Expired session or missing credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Broker processed the request and refused it.
    #[error("broker rejected request: {message} (code {code})")]
    Rejected { code: String, message: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BrokerError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Short code persisted on failed orders.
    pub fn error_code(&self) -> String {
        match self {
            BrokerError::Validation { field, .. } => format!("validation:{}", field),
            BrokerError::Transport(_) => "transport".to_string(),
            BrokerError::Timeout => "timeout".to_string(),
            BrokerError::Authentication(_) => "authentication".to_string(),
            BrokerError::Rejected { code, .. } => code.clone(),
            BrokerError::Serialization(_) => "serialization".to_string(),
        }
    }

    /// Whether the user's connection should be marked unhealthy.
    pub fn is_auth(&self) -> bool {
        matches!(self, BrokerError::Authentication(_))
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BrokerError::Timeout
        } else if err.status().map(|s| s.as_u16() == 401 || s.as_u16() == 403).unwrap_or(false) {
            BrokerError::Authentication(err.to_string())
        } else if err.is_decode() {
            BrokerError::Serialization(err.to_string())
        } else {
            BrokerError::Transport(err.to_string())
        }
    }
}

// =============================================================================
// Validation
// =============================================================================

/// An order whose required fields have been checked.
#[derive(Debug, Clone)]
pub struct ValidatedOrder {
    pub side: OrderSide,
    pub segment: ExchangeSegment,
    pub product: ProductType,
    pub order_type: OrderType,
    pub security_id: String,
    pub trading_symbol: String,
    pub quantity: u64,
    pub price: f64,
    pub trigger_price: f64,
    pub correlation_id: Option<String>,
}

/// Check required order fields before any network call.
pub fn validate_order(spec: &OrderSpec) -> BrokerResult<ValidatedOrder> {
    let side = spec
        .transaction_type
        .ok_or_else(|| BrokerError::invalid("transactionType", "transaction direction is required"))?;
    let segment = spec
        .exchange_segment
        .ok_or_else(|| BrokerError::invalid("exchangeSegment", "exchange segment is required"))?;
    let product = spec
        .product_type
        .ok_or_else(|| BrokerError::invalid("productType", "product type is required"))?;
    let order_type = spec
        .order_type
        .ok_or_else(|| BrokerError::invalid("orderType", "order type is required"))?;
    if spec.security_id.trim().is_empty() {
        return Err(BrokerError::invalid("securityId", "security id is required"));
    }
    if spec.quantity <= 0 {
        return Err(BrokerError::invalid("quantity", "quantity must be positive"));
    }

    let price = spec.price.unwrap_or(0.0);
    let trigger_price = spec.trigger_price.unwrap_or(0.0);
    if matches!(order_type, OrderType::Limit | OrderType::StopLoss) && price <= 0.0 {
        return Err(BrokerError::invalid("price", "limit orders require a price"));
    }
    if matches!(order_type, OrderType::StopLoss | OrderType::StopLossMarket) && trigger_price <= 0.0 {
        return Err(BrokerError::invalid("triggerPrice", "stop-loss orders require a trigger price"));
    }

    Ok(ValidatedOrder {
        side,
        segment,
        product,
        order_type,
        security_id: spec.security_id.trim().to_string(),
        trading_symbol: spec.trading_symbol.clone(),
        quantity: spec.quantity as u64,
        price,
        trigger_price,
        correlation_id: spec.correlation_id.clone(),
    })
}

// =============================================================================
// Traits
// =============================================================================

/// Order routing capabilities every broker provides.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn kind(&self) -> BrokerKind;

    /// Validate and submit an order.
    async fn place_order(&self, spec: &OrderSpec) -> BrokerResult<OrderAck>;

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()>;

    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>>;

    async fn get_order_book(&self) -> BrokerResult<Vec<BrokerOrder>>;

    async fn get_holdings(&self) -> BrokerResult<Vec<Holding>>;

    async fn get_funds(&self) -> BrokerResult<Funds>;

    /// Fetch the account profile to prove the session works.
    async fn test_connection(&self) -> BrokerResult<BrokerProfile>;
}

/// Builds adapters from stored connections.
pub trait BrokerFactory: Send + Sync {
    fn connect(&self, connection: &BrokerConnection) -> BrokerResult<Arc<dyn BrokerAdapter>>;
}

/// Factory for the REST adapters.
pub struct HttpBrokerFactory {
    config: BrokerConfig,
}

impl HttpBrokerFactory {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

impl BrokerFactory for HttpBrokerFactory {
    fn connect(&self, connection: &BrokerConnection) -> BrokerResult<Arc<dyn BrokerAdapter>> {
        if connection.credentials.access_token.trim().is_empty() {
            return Err(BrokerError::Authentication(format!(
                "no session token for {} user {}",
                connection.broker, connection.user_id
            )));
        }
        let timeout = self.config.timeout();
        let adapter: Arc<dyn BrokerAdapter> = match connection.broker {
            BrokerKind::AngelOne => Arc::new(AngelOneAdapter::new(
                &self.config.angel_one_base_url,
                connection.credentials.clone(),
                timeout,
            )?),
            BrokerKind::Dhan => Arc::new(DhanAdapter::new(
                &self.config.dhan_base_url,
                connection.credentials.clone(),
                timeout,
            )?),
        };
        Ok(adapter)
    }
}

/// HTTP client with a bounded request timeout.
pub(crate) fn http_client(timeout: Duration) -> BrokerResult<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(5).min(timeout))
        .timeout(timeout)
        .build()
        .map_err(|err| BrokerError::Transport(err.to_string()))
}
