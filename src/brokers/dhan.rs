//! Dhan v2 REST adapter.

use super::{http_client, validate_order, BrokerAdapter, BrokerError, BrokerResult, ValidatedOrder};
use crate::types::{
    BrokerCredentials, BrokerKind, BrokerOrder, BrokerPosition, BrokerProfile, ExchangeSegment,
    Funds, Holding, OrderAck, OrderSide, OrderSpec, OrderStatus, OrderType, ProductType,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Error body returned with non-2xx responses.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DhanError {
    #[serde(default)]
    error_type: String,
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
}

impl DhanError {
    fn into_broker_error(self, http_status: u16) -> BrokerError {
        // DH-901 is an invalid or expired access token
        if http_status == 401
            || self.error_code == "DH-901"
            || self.error_type.eq_ignore_ascii_case("Invalid_Authentication")
        {
            return BrokerError::Authentication(self.error_message);
        }
        let code = if self.error_code.is_empty() {
            format!("http_{}", http_status)
        } else {
            self.error_code
        };
        BrokerError::Rejected {
            code,
            message: self.error_message,
        }
    }
}

pub struct DhanAdapter {
    http: Client,
    base_url: String,
    credentials: BrokerCredentials,
}

impl DhanAdapter {
    pub fn new(base_url: &str, credentials: BrokerCredentials, timeout: Duration) -> BrokerResult<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, builder: RequestBuilder) -> BrokerResult<Value> {
        let resp = builder
            .header("access-token", &self.credentials.access_token)
            .header("client-id", &self.credentials.client_id)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(BrokerError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let body: DhanError = resp.json().await.unwrap_or_default();
            return Err(body.into_broker_error(status.as_u16()));
        }
        let text = resp.text().await.map_err(BrokerError::from_reqwest)?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|err| BrokerError::Serialization(err.to_string()))
    }
}

// =============================================================================
// Wire Mapping
// =============================================================================

fn segment(segment: ExchangeSegment) -> &'static str {
    match segment {
        ExchangeSegment::NseEq => "NSE_EQ",
        ExchangeSegment::NseFno => "NSE_FNO",
        ExchangeSegment::BseEq => "BSE_EQ",
        ExchangeSegment::BseFno => "BSE_FNO",
    }
}

fn parse_segment(value: &str) -> Option<ExchangeSegment> {
    match value {
        "NSE_EQ" => Some(ExchangeSegment::NseEq),
        "NSE_FNO" => Some(ExchangeSegment::NseFno),
        "BSE_EQ" => Some(ExchangeSegment::BseEq),
        "BSE_FNO" => Some(ExchangeSegment::BseFno),
        _ => None,
    }
}

fn product(product: ProductType) -> &'static str {
    match product {
        ProductType::Intraday => "INTRADAY",
        ProductType::Margin => "MARGIN",
        ProductType::Delivery => "CNC",
    }
}

fn parse_product(value: &str) -> Option<ProductType> {
    match value {
        "INTRADAY" => Some(ProductType::Intraday),
        "MARGIN" => Some(ProductType::Margin),
        "CNC" => Some(ProductType::Delivery),
        _ => None,
    }
}

fn order_type(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::StopLoss => "STOP_LOSS",
        OrderType::StopLossMarket => "STOP_LOSS_MARKET",
    }
}

fn parse_status(value: &str) -> OrderStatus {
    match value {
        "TRADED" => OrderStatus::Filled,
        "PART_TRADED" => OrderStatus::PartiallyFilled,
        "REJECTED" => OrderStatus::Rejected,
        "CANCELLED" | "EXPIRED" => OrderStatus::Cancelled,
        _ => OrderStatus::Open,
    }
}

fn num(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or_default(),
        Value::String(s) => s.trim().parse().unwrap_or_default(),
        _ => 0.0,
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn rows(data: &Value) -> &[Value] {
    data.as_array().map(Vec::as_slice).unwrap_or_default()
}

fn order_payload(client_id: &str, order: &ValidatedOrder) -> Value {
    json!({
        "dhanClientId": client_id,
        "correlationId": order.correlation_id.clone().unwrap_or_default(),
        "transactionType": match order.side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        },
        "exchangeSegment": segment(order.segment),
        "productType": product(order.product),
        "orderType": order_type(order.order_type),
        "validity": "DAY",
        "securityId": order.security_id,
        "quantity": order.quantity,
        "price": order.price,
        "triggerPrice": order.trigger_price,
    })
}

fn parse_order_book(data: &Value) -> Vec<BrokerOrder> {
    rows(data)
        .iter()
        .map(|row| {
            let raw_status = text(&row["orderStatus"]);
            let average = num(&row["averageTradedPrice"]);
            BrokerOrder {
                order_id: text(&row["orderId"]),
                trading_symbol: text(&row["tradingSymbol"]),
                side: match text(&row["transactionType"]).as_str() {
                    "BUY" => Some(OrderSide::Buy),
                    "SELL" => Some(OrderSide::Sell),
                    _ => None,
                },
                quantity: num(&row["quantity"]) as i64,
                filled_quantity: num(&row["filledQty"]) as i64,
                price: num(&row["price"]),
                average_price: (average > 0.0).then_some(average),
                status: parse_status(&raw_status),
                raw_status,
            }
        })
        .collect()
}

fn parse_positions(data: &Value) -> Vec<BrokerPosition> {
    rows(data)
        .iter()
        .map(|row| BrokerPosition {
            trading_symbol: text(&row["tradingSymbol"]),
            security_id: text(&row["securityId"]),
            exchange_segment: parse_segment(&text(&row["exchangeSegment"])),
            product_type: parse_product(&text(&row["productType"])),
            net_quantity: num(&row["netQty"]) as i64,
            average_price: num(&row["costPrice"]),
            realized_pnl: num(&row["realizedProfit"]),
            unrealized_pnl: num(&row["unrealizedProfit"]),
        })
        .collect()
}

#[async_trait]
impl BrokerAdapter for DhanAdapter {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Dhan
    }

    async fn place_order(&self, spec: &OrderSpec) -> BrokerResult<OrderAck> {
        let order = validate_order(spec)?;
        let body = order_payload(&self.credentials.client_id, &order);
        debug!("Dhan place order {} x{}", order.security_id, order.quantity);

        let data = self.send(self.http.post(self.url("/orders")).json(&body)).await?;
        let order_id = text(&data["orderId"]);
        if order_id.is_empty() {
            return Err(BrokerError::Serialization("order response has no orderId".to_string()));
        }
        let raw_status = text(&data["orderStatus"]);
        Ok(OrderAck {
            order_id,
            status: parse_status(&raw_status),
            raw_status,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        self.send(self.http.delete(self.url(&format!("/orders/{}", order_id))))
            .await?;
        Ok(())
    }

    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        let data = self.send(self.http.get(self.url("/positions"))).await?;
        Ok(parse_positions(&data))
    }

    async fn get_order_book(&self) -> BrokerResult<Vec<BrokerOrder>> {
        let data = self.send(self.http.get(self.url("/orders"))).await?;
        Ok(parse_order_book(&data))
    }

    async fn get_holdings(&self) -> BrokerResult<Vec<Holding>> {
        let data = self.send(self.http.get(self.url("/holdings"))).await?;
        Ok(rows(&data)
            .iter()
            .map(|row| {
                let isin = text(&row["isin"]);
                let ltp = num(&row["lastTradedPrice"]);
                Holding {
                    trading_symbol: text(&row["tradingSymbol"]),
                    isin: (!isin.is_empty()).then_some(isin),
                    quantity: num(&row["totalQty"]) as i64,
                    average_price: num(&row["avgCostPrice"]),
                    last_price: (ltp > 0.0).then_some(ltp),
                }
            })
            .collect())
    }

    async fn get_funds(&self) -> BrokerResult<Funds> {
        let data = self.send(self.http.get(self.url("/fundlimit"))).await?;
        // The API spells this field "availabelBalance"
        let available = if data.get("availabelBalance").is_some() {
            num(&data["availabelBalance"])
        } else {
            num(&data["availableBalance"])
        };
        Ok(Funds {
            available_balance: available,
            used_margin: num(&data["utilizedAmount"]),
            collateral: num(&data["collateralAmount"]),
        })
    }

    async fn test_connection(&self) -> BrokerResult<BrokerProfile> {
        let data = self.send(self.http.get(self.url("/profile"))).await?;
        let client_id = text(&data["dhanClientId"]);
        Ok(BrokerProfile {
            broker: BrokerKind::Dhan,
            client_id: if client_id.is_empty() {
                self.credentials.client_id.clone()
            } else {
                client_id
            },
            name: None,
        })
    }
}
