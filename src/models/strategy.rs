//! Strategies and their ordered price targets.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Candle, OrderSide};

/// Directional bias of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyDirection {
    /// Always buy
    Long,
    /// Always sell
    Short,
    /// Trade in the direction of the previous daily candle
    TrendFollow,
    /// Trade against the previous daily candle
    TrendReverse,
}

impl StrategyDirection {
    /// Pick the order side for the previous daily candle.
    ///
    /// Without candle data the side defaults to [`OrderSide::Buy`].
    pub fn side_for(&self, previous: Option<&Candle>) -> OrderSide {
        let Some(candle) = previous else {
            return OrderSide::Buy;
        };

        let bullish = candle.is_bullish();
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
            Self::TrendFollow if bullish => OrderSide::Buy,
            Self::TrendFollow => OrderSide::Sell,
            Self::TrendReverse if bullish => OrderSide::Sell,
            Self::TrendReverse => OrderSide::Buy,
        }
    }
}

/// A trading rule. Root strategies (`root_id` unset) are evaluated daily;
/// child strategies share the root's order accounting.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub direction: StrategyDirection,
    pub is_close_before_new_candle: bool,
    pub is_active: bool,
    pub root_id: Option<i64>,
}

impl Strategy {
    pub fn is_root(&self) -> bool {
        self.root_id.is_none()
    }
}

/// Ordered price level of a (strategy, token) pair.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Target {
    pub id: i64,
    pub strategy_id: i64,
    pub token_id: i64,

    /// Position in the crossing order, starting at 0
    pub sequence: i64,

    /// Level that must be crossed to advance past this target
    #[sqlx(try_from = "f64")]
    pub price: Decimal,

    /// Protective stop kept while this target is the active one
    #[sqlx(try_from = "f64")]
    pub stop_price: Decimal,
}

impl Target {
    /// Whether `price` has reached this target for a position opened on `side`.
    pub fn is_crossed(&self, side: OrderSide, price: Decimal) -> bool {
        match side {
            OrderSide::Buy => price >= self.price,
            OrderSide::Sell => price <= self.price,
        }
    }
}
