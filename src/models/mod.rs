//! Data models for tokens, strategies, pooled orders, users and settlement records.

mod candle;
mod order;
mod records;
mod strategy;
mod token;
mod user;

pub use candle::Candle;
pub use order::{CloseReason, Order, OrderSide, OrderStatus, UserOrder};
pub use records::{Activity, Notification, NotificationKind, OperatorAlert};
pub use strategy::{Strategy, StrategyDirection, Target};
pub use token::Token;
pub use user::{User, UserBudget};
