//! Pooled exchange orders and the per-user shares of them.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// Side that reduces a position opened on `self`.
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order status. Transitions only ACTIVE -> CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Active,
    Closed,
}

/// Why an order was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    /// Closed by the daily re-evaluation before a new order is opened
    NewCandle,
    /// The last target was crossed
    FinalTarget,
    /// The protective stop was filled on the exchange
    StoplossFilled,
    /// Administrative close
    Manual,
}

/// One exchange position opened on behalf of pooled users.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    /// Exchange-assigned order id
    pub order_id: String,
    pub token_id: i64,
    pub strategy_id: i64,
    pub status: OrderStatus,
    pub side: OrderSide,

    #[sqlx(try_from = "f64")]
    pub quantity: Decimal,

    #[sqlx(try_from = "f64")]
    pub entry_price: Decimal,

    /// Realized result, meaningful once CLOSED
    #[sqlx(try_from = "f64")]
    pub net_profit: Decimal,

    /// Sequence of the next target that has not been crossed yet
    pub active_target: i64,

    /// Exchange id of the live protective stop
    pub stoploss_order_id: Option<String>,

    /// False when no stop could be placed or the stop was cancelled externally
    pub is_protected: bool,

    pub close_reason: Option<CloseReason>,
    pub created_at: String,
    pub closed_at: Option<String>,
}

impl Order {
    pub fn is_active(&self) -> bool {
        self.status == OrderStatus::Active
    }

    /// PnL of the whole position if it were closed at `exit_price`.
    pub fn pnl_at(&self, exit_price: Decimal) -> Decimal {
        match self.side {
            OrderSide::Buy => (exit_price - self.entry_price) * self.quantity,
            OrderSide::Sell => (self.entry_price - exit_price) * self.quantity,
        }
    }
}

/// A user's share of a pooled order.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserOrder {
    pub id: i64,
    pub user_id: i64,
    pub order_id: String,

    /// Share of the pooled budget, in (0, 1]
    #[sqlx(try_from = "f64")]
    pub contribution_percent: Decimal,

    /// Fee rate charged on this user's profit, in percent
    #[sqlx(try_from = "f64")]
    pub commission_percent: Decimal,

    #[sqlx(try_from = "f64")]
    pub quantity: Decimal,

    /// Fee charged at settlement
    #[sqlx(try_from = "f64")]
    pub commission: Decimal,

    pub is_settled: bool,
}
