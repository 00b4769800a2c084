//! REST client for a USDⓈ-M perpetual futures API.
//!
//! Handles:
//! - HMAC-SHA256 request signing for account/trade endpoints
//! - Market, stop and take-profit order placement
//! - Realized PnL lookup for closing orders
//! - Public market data (prices, symbol filters, daily klines)

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{ExchangeError, ExchangeResult};
use crate::models::{Candle, OrderSide};

use super::{
    CandleSource, ConditionalKind, Exchange, FillStatus, OrderUpdate, PlacedOrder, SymbolRules,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_WINDOW_MS: u64 = 5000;

/// Error codes that mean "try again later" rather than "no".
const TRANSIENT_CODES: [i64; 4] = [-1001, -1003, -1007, -1008];
/// Cancelling an order that is already gone.
const UNKNOWN_ORDER: i64 = -2011;

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    #[serde(default)]
    avg_price: Decimal,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserTrade {
    #[serde(default)]
    realized_pnl: Decimal,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    filters: Vec<serde_json::Value>,
}

/// Futures REST API client. Without credentials only public endpoints work.
pub struct RestExchange {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    rules: RwLock<HashMap<String, SymbolRules>>,
}

impl RestExchange {
    /// Client for public market data only.
    pub fn public(base_url: &str) -> Result<Self> {
        Self::build(base_url, None, None)
    }

    /// Client able to trade.
    #[cfg(test)]
    pub fn new(base_url: &str, api_key: String, api_secret: String) -> Result<Self> {
        Self::build(base_url, Some(api_key), Some(api_secret))
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::build(
            &config.exchange_base_url,
            config.api_key.clone(),
            config.api_secret.clone(),
        )
    }

    fn build(base_url: &str, api_key: Option<String>, api_secret: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
            rules: RwLock::new(HashMap::new()),
        })
    }

    fn sign(&self, query: &str) -> ExchangeResult<String> {
        let secret = self
            .api_secret
            .as_deref()
            .ok_or_else(|| ExchangeError::rejected(0, "API secret not configured"))?;

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| ExchangeError::rejected(0, e.to_string()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<T> {
        let url = format!("{}{}?{}", self.base_url, path, encode(params));
        debug!(url = %url, "Public request");

        let response = self.http.get(&url).send().await?;
        Self::read(response).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> ExchangeResult<T> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ExchangeError::rejected(0, "API key not configured"))?;

        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));

        let query = encode(&params);
        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);
        debug!(method = %method, path = %path, "Signed request");

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await?;

        Self::read(response).await
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> ExchangeResult<T> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(classify(status, &body));
        }

        serde_json::from_str(&body).map_err(ExchangeError::from)
    }

    async fn submit_market(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> ExchangeResult<OrderResponse> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("newOrderRespType", "RESULT".to_string()),
            ("newClientOrderId", client_order_id()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        self.signed(Method::POST, "/fapi/v1/order", params).await
    }
}

/// Exchange-side idempotency key; at most 36 characters.
fn client_order_id() -> String {
    format!("pt-{}", Uuid::new_v4().simple())
}

fn encode(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn classify(status: StatusCode, body: &str) -> ExchangeError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::IM_A_TEAPOT
        || status.is_server_error()
    {
        return ExchangeError::Transient(format!("{} - {}", status, body));
    }

    match serde_json::from_str::<ApiError>(body) {
        Ok(err) if TRANSIENT_CODES.contains(&err.code) => ExchangeError::Transient(err.msg),
        Ok(err) => ExchangeError::rejected(err.code, err.msg),
        Err(_) => ExchangeError::rejected(i64::from(status.as_u16()), body.to_string()),
    }
}

fn conditional_type(kind: ConditionalKind) -> &'static str {
    match kind {
        ConditionalKind::Stop => "STOP_MARKET",
        ConditionalKind::TakeProfit => "TAKE_PROFIT_MARKET",
        ConditionalKind::Market => "MARKET",
    }
}

fn parse_filters(filters: &[serde_json::Value]) -> SymbolRules {
    let field = |filter_type: &str, key: &str| -> Decimal {
        filters
            .iter()
            .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some(filter_type))
            .and_then(|f| f.get(key))
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO)
    };

    SymbolRules {
        min_qty: field("LOT_SIZE", "minQty"),
        step_size: field("LOT_SIZE", "stepSize"),
        min_notional: field("MIN_NOTIONAL", "notional"),
    }
}

fn parse_kline(row: &[serde_json::Value]) -> Option<Candle> {
    let dec = |i: usize| -> Option<Decimal> {
        row.get(i)
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
    };
    let open_time = row.first()?.as_i64()?;

    Some(Candle {
        open: dec(1)?,
        high: dec(2)?,
        low: dec(3)?,
        close: dec(4)?,
        volume: dec(5)?,
        date: Utc.timestamp_millis_opt(open_time).single()?,
    })
}

#[async_trait]
impl Exchange for RestExchange {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        let _: serde_json::Value = self.signed(Method::POST, "/fapi/v1/leverage", params).await?;
        Ok(())
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> ExchangeResult<PlacedOrder> {
        let response = self.submit_market(symbol, side, quantity, false).await?;

        Ok(PlacedOrder {
            order_id: response.order_id.to_string(),
            avg_price: response.avg_price,
        })
    }

    async fn place_conditional_order(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: ConditionalKind,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> ExchangeResult<String> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", conditional_type(kind).to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("reduceOnly", "true".to_string()),
            ("newClientOrderId", client_order_id()),
        ];
        if kind != ConditionalKind::Market {
            params.push(("stopPrice", stop_price.normalize().to_string()));
            params.push(("workingType", "MARK_PRICE".to_string()));
        }

        let response: OrderResponse = self.signed(Method::POST, "/fapi/v1/order", params).await?;
        Ok(response.order_id.to_string())
    }

    async fn cancel_orders(&self, symbol: &str, order_ids: &[String]) -> ExchangeResult<()> {
        for order_id in order_ids {
            let params = vec![
                ("symbol", symbol.to_string()),
                ("orderId", order_id.clone()),
            ];
            let result: ExchangeResult<serde_json::Value> =
                self.signed(Method::DELETE, "/fapi/v1/order", params).await;

            match result {
                Ok(_) => {}
                Err(ExchangeError::Rejected { code, .. }) if code == UNKNOWN_ORDER => {
                    debug!(order_id = %order_id, "Order already gone");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn close_market(
        &self,
        symbol: &str,
        position_side: OrderSide,
        quantity: Decimal,
    ) -> ExchangeResult<Decimal> {
        let response = self
            .submit_market(symbol, position_side.opposite(), quantity, true)
            .await?;

        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", response.order_id.to_string()),
        ];
        let trades: Vec<UserTrade> = self
            .signed(Method::GET, "/fapi/v1/userTrades", params)
            .await?;

        if trades.is_empty() {
            warn!(
                symbol = %symbol,
                order_id = response.order_id,
                status = %response.status,
                "No fills reported for closing order"
            );
        }

        Ok(trades.iter().map(|t| t.realized_pnl).sum())
    }

    async fn last_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let ticker: TickerPrice = self
            .public_get("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        Ok(ticker.price)
    }

    async fn symbol_rules(&self, symbol: &str) -> ExchangeResult<SymbolRules> {
        if let Some(rules) = self.rules.read().await.get(symbol) {
            return Ok(rules.clone());
        }

        let info: ExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;
        let mut cache = self.rules.write().await;
        for s in info.symbols {
            cache.insert(s.symbol.clone(), parse_filters(&s.filters));
        }

        cache
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::rejected(-1121, format!("Invalid symbol {}", symbol)))
    }

    async fn order_status(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderUpdate> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let response: OrderResponse = self.signed(Method::GET, "/fapi/v1/order", params).await?;

        Ok(OrderUpdate {
            order_id: order_id.to_string(),
            status: FillStatus::from_exchange(&response.status),
            avg_price: Some(response.avg_price).filter(|p| *p > Decimal::ZERO),
        })
    }
}

#[async_trait]
impl CandleSource for RestExchange {
    async fn last_n_day_candles(&self, symbol: &str, n: usize) -> ExchangeResult<Vec<Candle>> {
        // one extra row: the newest kline is still forming
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", "1d".to_string()),
            ("limit", (n + 1).to_string()),
        ];
        let rows: Vec<Vec<serde_json::Value>> = self.public_get("/fapi/v1/klines", &params).await?;

        let now = Utc::now().timestamp_millis();
        let mut candles: Vec<Candle> = rows
            .iter()
            .filter(|row| row.get(6).and_then(|v| v.as_i64()).is_some_and(|close| close < now))
            .filter_map(|row| parse_kline(row))
            .collect();

        if candles.len() > n {
            candles.drain(..candles.len() - n);
        }
        Ok(candles)
    }
}
