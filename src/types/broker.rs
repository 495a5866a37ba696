//! Broker Types
//!
//! Connection records and the broker-neutral shapes adapters translate
//! AngelOne and Dhan responses into.

use serde::{Deserialize, Serialize};

use super::{ExchangeSegment, OrderSide, OrderStatus, ProductType};

/// Supported brokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    AngelOne,
    Dhan,
}

impl BrokerKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "angel_one" => Some(BrokerKind::AngelOne),
            "dhan" => Some(BrokerKind::Dhan),
            _ => None,
        }
    }
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerKind::AngelOne => write!(f, "angel_one"),
            BrokerKind::Dhan => write!(f, "dhan"),
        }
    }
}

/// Session credentials produced by the (external) OAuth handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerCredentials {
    pub client_id: String,
    /// JWT for AngelOne, access token for Dhan
    pub access_token: String,
    /// AngelOne `X-PrivateKey`; unused by Dhan
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// A user's stored broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConnection {
    pub user_id: String,
    pub broker: BrokerKind,
    pub credentials: BrokerCredentials,
    pub is_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: i64,
}

impl BrokerConnection {
    pub fn new(user_id: String, broker: BrokerKind, credentials: BrokerCredentials) -> Self {
        Self {
            user_id,
            broker,
            credentials,
            is_connected: true,
            last_error: None,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

// =============================================================================
// Adapter Responses
// =============================================================================

/// Broker acknowledgement of a placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
    /// Status string as the broker reported it
    pub raw_status: String,
}

/// Row of a broker order book.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerOrder {
    pub order_id: String,
    pub trading_symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<OrderSide>,
    pub quantity: i64,
    pub filled_quantity: i64,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_price: Option<f64>,
    pub status: OrderStatus,
    pub raw_status: String,
}

/// Open or closed intraday position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerPosition {
    pub trading_symbol: String,
    pub security_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_segment: Option<ExchangeSegment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_type: Option<ProductType>,
    pub net_quantity: i64,
    pub average_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

/// Demat holding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub trading_symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isin: Option<String>,
    pub quantity: i64,
    pub average_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_price: Option<f64>,
}

/// Margin summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Funds {
    pub available_balance: f64,
    pub used_margin: f64,
    #[serde(default)]
    pub collateral: f64,
}

/// Account profile returned by a connection test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerProfile {
    pub broker: BrokerKind,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}
