//! Exchange collaborators: trading API, candle history and real-time events.

mod feed;
mod paper;
mod rest_client;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeResult;
use crate::models::{Candle, OrderSide};

pub use feed::PollingFeed;
pub use paper::PaperExchange;
pub use rest_client::RestExchange;

/// Kind of a trigger order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionalKind {
    TakeProfit,
    Stop,
    Market,
}

impl ConditionalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionalKind::TakeProfit => "TAKE_PROFIT",
            ConditionalKind::Stop => "STOP",
            ConditionalKind::Market => "MARKET",
        }
    }
}

/// A market order accepted by the exchange.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,

    /// Average fill price; zero when the exchange did not report it
    pub avg_price: Decimal,
}

/// Trading constraints of a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRules {
    pub min_qty: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
}

impl SymbolRules {
    /// Round a quantity down to the symbol's step size.
    pub fn floor_qty(&self, quantity: Decimal) -> Decimal {
        if self.step_size <= Decimal::ZERO {
            return quantity;
        }
        (quantity / self.step_size).floor() * self.step_size
    }
}

/// Exchange-side state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FillStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl FillStatus {
    pub fn from_exchange(status: &str) -> Self {
        match status {
            "PARTIALLY_FILLED" => Self::PartiallyFilled,
            "FILLED" => Self::Filled,
            "CANCELED" | "CANCELLED" => Self::Canceled,
            "EXPIRED" => Self::Expired,
            "REJECTED" => Self::Rejected,
            _ => Self::New,
        }
    }

    /// No further fills will happen.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Expired | Self::Rejected
        )
    }
}

/// Status change of an exchange order.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub order_id: String,
    pub status: FillStatus,
    pub avg_price: Option<Decimal>,
}

/// Real-time event delivered at least once.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Price { symbol: String, price: Decimal },
    Order(OrderUpdate),
}

/// Trading operations the engine needs from an exchange.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    /// Submit a market order.
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> ExchangeResult<PlacedOrder>;

    /// Submit a reduce-only trigger order; returns its exchange id.
    async fn place_conditional_order(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: ConditionalKind,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> ExchangeResult<String>;

    /// Cancel orders; ids the exchange no longer knows are ignored.
    async fn cancel_orders(&self, symbol: &str, order_ids: &[String]) -> ExchangeResult<()>;

    /// Close `quantity` of a position opened on `position_side` at market.
    /// Returns the realized PnL.
    async fn close_market(
        &self,
        symbol: &str,
        position_side: OrderSide,
        quantity: Decimal,
    ) -> ExchangeResult<Decimal>;

    async fn last_price(&self, symbol: &str) -> ExchangeResult<Decimal>;

    async fn symbol_rules(&self, symbol: &str) -> ExchangeResult<SymbolRules>;

    async fn order_status(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderUpdate>;
}

/// Daily candle history.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// The last `n` completed daily candles, most recent last.
    async fn last_n_day_candles(&self, symbol: &str, n: usize) -> ExchangeResult<Vec<Candle>>;
}
