//! Trading accounts and their budget allocations.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A trading account sharing pooled orders.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,

    /// Cumulative realized profit (negative after net losses)
    #[sqlx(try_from = "f64")]
    pub profit: Decimal,

    /// Cumulative fees paid
    #[sqlx(try_from = "f64")]
    pub commission: Decimal,

    /// Cumulative fee-derived reserve
    #[sqlx(try_from = "f64")]
    pub insurance: Decimal,

    /// Withdrawable / tradable now
    #[sqlx(try_from = "f64")]
    pub available_balance: Decimal,

    /// Margin reserve absorbing losses beyond the available balance
    #[sqlx(try_from = "f64")]
    pub trade_balance: Decimal,
}

/// How much a user commits to each order of a strategy.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserBudget {
    pub user_id: i64,
    pub strategy_id: i64,

    /// Quote-currency amount per order
    #[sqlx(try_from = "f64")]
    pub budget: Decimal,

    /// Fee rate on profits, in percent
    #[sqlx(try_from = "f64")]
    pub commission_percent: Decimal,

    /// Current available balance of the user, joined in for eligibility
    #[sqlx(try_from = "f64")]
    pub available_balance: Decimal,
}

impl UserBudget {
    /// A budget can fund an order only if the user can cover it.
    pub fn is_eligible(&self) -> bool {
        self.budget > Decimal::ZERO && self.budget <= self.available_balance
    }
}
