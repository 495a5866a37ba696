//! AngelOne SmartAPI adapter.

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

const ORDER_PATH: &str = "/rest/secure/angelbroking/order/v1";
const PORTFOLIO_PATH: &str = "/rest/secure/angelbroking/portfolio/v1";
const USER_PATH: &str = "/rest/secure/angelbroking/user/v1";

/// SmartAPI response envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    errorcode: String,
    #[serde(default)]
    data: Value,
}

pub struct AngelOneAdapter {
    http: Client,
    base_url: String,
    credentials: BrokerCredentials,
}

impl AngelOneAdapter {
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

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.credentials.access_token)
            .header("X-PrivateKey", self.credentials.api_key.as_deref().unwrap_or_default())
            .header("X-UserType", "USER")
            .header("X-SourceID", "WEB")
            .header("X-ClientLocalIP", "127.0.0.1")
            .header("X-ClientPublicIP", "127.0.0.1")
            .header("X-MACAddress", "00:00:00:00:00:00")
            .header("Accept", "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> BrokerResult<Value> {
        let resp = self
            .authorized(builder)
            .send()
            .await
            .map_err(BrokerError::from_reqwest)?;
        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(BrokerError::Authentication(format!("HTTP {}", status)));
        }
        let envelope: Envelope = resp.json().await.map_err(BrokerError::from_reqwest)?;
        ensure_success(envelope)
    }

    async fn get(&self, path: &str) -> BrokerResult<Value> {
        self.send(self.http.get(self.url(path))).await
    }

    async fn post(&self, path: &str, body: &Value) -> BrokerResult<Value> {
        self.send(self.http.post(self.url(path)).json(body)).await
    }
}

fn ensure_success(envelope: Envelope) -> BrokerResult<Value> {
    if envelope.status {
        return Ok(envelope.data);
    }
    // AG8xxx codes are session/token failures
    if envelope.errorcode.starts_with("AG8") {
        return Err(BrokerError::Authentication(envelope.message));
    }
    Err(BrokerError::Rejected {
        code: if envelope.errorcode.is_empty() {
            "rejected".to_string()
        } else {
            envelope.errorcode
        },
        message: envelope.message,
    })
}

// =============================================================================
// Wire Mapping
// =============================================================================

fn exchange(segment: ExchangeSegment) -> &'static str {
    match segment {
        ExchangeSegment::NseEq => "NSE",
        ExchangeSegment::NseFno => "NFO",
        ExchangeSegment::BseEq => "BSE",
        ExchangeSegment::BseFno => "BFO",
    }
}

fn parse_exchange(value: &str) -> Option<ExchangeSegment> {
    match value {
        "NSE" => Some(ExchangeSegment::NseEq),
        "NFO" => Some(ExchangeSegment::NseFno),
        "BSE" => Some(ExchangeSegment::BseEq),
        "BFO" => Some(ExchangeSegment::BseFno),
        _ => None,
    }
}

fn product(product: ProductType) -> &'static str {
    match product {
        ProductType::Intraday => "INTRADAY",
        ProductType::Margin => "CARRYFORWARD",
        ProductType::Delivery => "DELIVERY",
    }
}

fn parse_product(value: &str) -> Option<ProductType> {
    match value {
        "INTRADAY" => Some(ProductType::Intraday),
        "CARRYFORWARD" | "MARGIN" => Some(ProductType::Margin),
        "DELIVERY" => Some(ProductType::Delivery),
        _ => None,
    }
}

fn order_type(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::StopLoss => "STOPLOSS_LIMIT",
        OrderType::StopLossMarket => "STOPLOSS_MARKET",
    }
}

fn parse_status(value: &str) -> OrderStatus {
    match value.to_ascii_lowercase().as_str() {
        "complete" => OrderStatus::Filled,
        "rejected" => OrderStatus::Rejected,
        "cancelled" => OrderStatus::Cancelled,
        _ => OrderStatus::Open,
    }
}

/// SmartAPI returns most numbers as strings.
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

fn order_payload(order: &ValidatedOrder) -> Value {
    let variety = if matches!(order.order_type, OrderType::StopLoss | OrderType::StopLossMarket) {
        "STOPLOSS"
    } else {
        "NORMAL"
    };
    let mut body = json!({
        "variety": variety,
        "tradingsymbol": order.trading_symbol,
        "symboltoken": order.security_id,
        "transactiontype": match order.side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        },
        "exchange": exchange(order.segment),
        "ordertype": order_type(order.order_type),
        "producttype": product(order.product),
        "duration": "DAY",
        "price": order.price.to_string(),
        "triggerprice": order.trigger_price.to_string(),
        "quantity": order.quantity.to_string(),
    });
    if let (Some(tag), Some(obj)) = (&order.correlation_id, body.as_object_mut()) {
        obj.insert("ordertag".to_string(), Value::String(tag.clone()));
    }
    body
}

fn parse_order_book(data: &Value) -> Vec<BrokerOrder> {
    rows(data)
        .iter()
        .map(|row| {
            let raw_status = text(&row["status"]);
            let average = num(&row["averageprice"]);
            BrokerOrder {
                order_id: text(&row["orderid"]),
                trading_symbol: text(&row["tradingsymbol"]),
                side: match text(&row["transactiontype"]).as_str() {
                    "BUY" => Some(OrderSide::Buy),
                    "SELL" => Some(OrderSide::Sell),
                    _ => None,
                },
                quantity: num(&row["quantity"]) as i64,
                filled_quantity: num(&row["filledshares"]) as i64,
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
            trading_symbol: text(&row["tradingsymbol"]),
            security_id: text(&row["symboltoken"]),
            exchange_segment: parse_exchange(&text(&row["exchange"])),
            product_type: parse_product(&text(&row["producttype"])),
            net_quantity: num(&row["netqty"]) as i64,
            average_price: num(&row["avgnetprice"]),
            realized_pnl: num(&row["realised"]),
            unrealized_pnl: num(&row["unrealised"]),
        })
        .collect()
}

#[async_trait]
impl BrokerAdapter for AngelOneAdapter {
    fn kind(&self) -> BrokerKind {
        BrokerKind::AngelOne
    }

    async fn place_order(&self, spec: &OrderSpec) -> BrokerResult<OrderAck> {
        let order = validate_order(spec)?;
        let body = order_payload(&order);
        debug!("AngelOne placeOrder {} x{}", order.trading_symbol, order.quantity);

        let data = self.post(&format!("{}/placeOrder", ORDER_PATH), &body).await?;
        let order_id = text(&data["orderid"]);
        if order_id.is_empty() {
            return Err(BrokerError::Serialization("placeOrder response has no orderid".to_string()));
        }
        Ok(OrderAck {
            order_id,
            status: OrderStatus::Open,
            raw_status: "placed".to_string(),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let body = json!({ "variety": "NORMAL", "orderid": order_id });
        self.post(&format!("{}/cancelOrder", ORDER_PATH), &body).await?;
        Ok(())
    }

    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        let data = self.get(&format!("{}/getPosition", ORDER_PATH)).await?;
        Ok(parse_positions(&data))
    }

    async fn get_order_book(&self) -> BrokerResult<Vec<BrokerOrder>> {
        let data = self.get(&format!("{}/getOrderBook", ORDER_PATH)).await?;
        Ok(parse_order_book(&data))
    }

    async fn get_holdings(&self) -> BrokerResult<Vec<Holding>> {
        let data = self.get(&format!("{}/getHolding", PORTFOLIO_PATH)).await?;
        Ok(rows(&data)
            .iter()
            .map(|row| {
                let isin = text(&row["isin"]);
                let ltp = num(&row["ltp"]);
                Holding {
                    trading_symbol: text(&row["tradingsymbol"]),
                    isin: (!isin.is_empty()).then_some(isin),
                    quantity: num(&row["quantity"]) as i64,
                    average_price: num(&row["averageprice"]),
                    last_price: (ltp > 0.0).then_some(ltp),
                }
            })
            .collect())
    }

    async fn get_funds(&self) -> BrokerResult<Funds> {
        let data = self.get(&format!("{}/getRMS", USER_PATH)).await?;
        Ok(Funds {
            available_balance: num(&data["availablecash"]),
            used_margin: num(&data["utiliseddebits"]),
            collateral: num(&data["collateral"]),
        })
    }

    async fn test_connection(&self) -> BrokerResult<BrokerProfile> {
        let data = self.get(&format!("{}/getProfile", USER_PATH)).await?;
        let name = text(&data["name"]);
        Ok(BrokerProfile {
            broker: BrokerKind::AngelOne,
            client_id: text(&data["clientcode"]),
            name: (!name.is_empty()).then_some(name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(order_type: OrderType) -> ValidatedOrder {
        ValidatedOrder {
            side: OrderSide::Sell,
            segment: ExchangeSegment::NseFno,
            product: ProductType::Intraday,
            order_type,
            security_id: "43210".to_string(),
            trading_symbol: "NIFTY14MAR2422000PE".to_string(),
            quantity: 50,
            price: 0.0,
            trigger_price: 0.0,
            correlation_id: Some("tag-1".to_string()),
        }
    }

    #[test]
    fn test_order_payload() {
        let body = order_payload(&order(OrderType::Market));
        assert_eq!(body["variety"], "NORMAL");
        assert_eq!(body["transactiontype"], "SELL");
        assert_eq!(body["exchange"], "NFO");
        assert_eq!(body["producttype"], "INTRADAY");
        assert_eq!(body["quantity"], "50");
        assert_eq!(body["ordertag"], "tag-1");

        let stop = order_payload(&order(OrderType::StopLossMarket));
        assert_eq!(stop["variety"], "STOPLOSS");
        assert_eq!(stop["ordertype"], "STOPLOSS_MARKET");
    }

    #[test]
    fn test_envelope_errors() {
        let expired = Envelope {
            status: false,
            message: "Invalid Token".to_string(),
            errorcode: "AG8001".to_string(),
            data: Value::Null,
        };
        assert!(ensure_success(expired).unwrap_err().is_auth());

        let rejected = Envelope {
            status: false,
            message: "Insufficient funds".to_string(),
            errorcode: "AB4008".to_string(),
            data: Value::Null,
        };
        assert_eq!(ensure_success(rejected).unwrap_err().error_code(), "AB4008");
    }

    #[test]
    fn test_parse_order_book() {
        let data = json!([{
            "orderid": "240311000000123",
            "tradingsymbol": "NIFTY14MAR2422000CE",
            "transactiontype": "BUY",
            "quantity": "50",
            "filledshares": "50",
            "price": 0,
            "averageprice": "151.25",
            "status": "complete"
        }]);
        let book = parse_order_book(&data);
        assert_eq!(book.len(), 1);
        assert_eq!(book[0].status, OrderStatus::Filled);
        assert_eq!(book[0].filled_quantity, 50);
        assert_eq!(book[0].average_price, Some(151.25));
        assert!(parse_order_book(&Value::Null).is_empty());
    }

    #[test]
    fn test_parse_positions() {
        let data = json!([{
            "tradingsymbol": "NIFTY14MAR2422000CE",
            "symboltoken": "43210",
            "exchange": "NFO",
            "producttype": "CARRYFORWARD",
            "netqty": "-50",
            "avgnetprice": "120.5",
            "realised": "0",
            "unrealised": "-250.0"
        }]);
        let positions = parse_positions(&data);
        assert_eq!(positions[0].net_quantity, -50);
        assert_eq!(positions[0].product_type, Some(ProductType::Margin));
        assert_eq!(positions[0].exchange_segment, Some(ExchangeSegment::NseFno));
    }

    #[tokio::test]
    async fn test_place_order_validates_before_network() {
        let adapter = AngelOneAdapter::new(
            "http://127.0.0.1:9",
            BrokerCredentials::default(),
            Duration::from_secs(1),
        )
        .unwrap();
        let mut spec = OrderSpec::market(
            OrderSide::Buy,
            ExchangeSegment::NseFno,
            "43210".to_string(),
            "NIFTY14MAR2422000CE".to_string(),
            0,
        );
        spec.product_type = None;
        let err = adapter.place_order(&spec).await.unwrap_err();
        assert!(matches!(err, BrokerError::Validation { field: "productType", .. }));
    }
}
