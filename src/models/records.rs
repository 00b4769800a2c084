//! Append-only settlement and audit records.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum NotificationKind {
    Profit,
    Loss,
}

impl NotificationKind {
    pub fn for_amount(amount: Decimal) -> Self {
        if amount >= Decimal::ZERO {
            Self::Profit
        } else {
            Self::Loss
        }
    }
}

/// User-facing profit/loss message.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub order_id: String,
    pub kind: NotificationKind,
    #[sqlx(try_from = "f64")]
    pub amount: Decimal,
    pub message: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    TradeSettlement,
}

/// Audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Activity {
    pub id: i64,
    pub user_id: i64,
    pub order_id: String,
    pub activity_type: ActivityType,
    #[sqlx(try_from = "f64")]
    pub value: Decimal,
    pub created_at: String,
}

/// Condition an operator has to act on (e.g. an order left without a stop).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OperatorAlert {
    pub id: i64,
    pub order_id: String,
    pub message: String,
    pub created_at: String,
}
