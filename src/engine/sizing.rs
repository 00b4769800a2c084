//! Pooled position sizing: turns user budgets into one exchange quantity and
//! the per-user shares of it.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::db::NewUserOrder;
use crate::exchange::SymbolRules;
use crate::models::UserBudget;

/// Tolerance on the sum of contributions.
pub const CONTRIBUTION_EPSILON: Decimal = dec!(0.000001);

/// Whether contributions summing to `total` describe the whole order.
pub fn contributions_balanced(total: Decimal) -> bool {
    (total - Decimal::ONE).abs() <= CONTRIBUTION_EPSILON
}

/// Why no order can be sized.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizingRejection {
    #[error("no eligible user budgets")]
    NoEligibleUsers,

    #[error("invalid price {0}")]
    InvalidPrice(Decimal),

    #[error("quantity {quantity} below minimum {min_qty}")]
    BelowMinQty { quantity: Decimal, min_qty: Decimal },

    #[error("notional {notional} below minimum {min_notional}")]
    BelowMinNotional {
        notional: Decimal,
        min_notional: Decimal,
    },

    #[error("contributions sum to {0}")]
    ContributionDrift(Decimal),
}

/// Result of sizing: aggregate quantity and who owns which part of it.
#[derive(Debug, Clone)]
pub struct SizingPlan {
    /// Exchange quantity, floored to the step size
    pub quantity: Decimal,
    pub price: Decimal,
    pub total_budget: Decimal,
    pub shares: Vec<NewUserOrder>,
}

impl SizingPlan {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }

    pub fn contribution_total(&self) -> Decimal {
        self.shares.iter().map(|s| s.contribution_percent).sum()
    }
}

/// Sizes pooled orders at a fixed leverage.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    leverage: Decimal,
}

impl PositionSizer {
    pub fn new(leverage: u32) -> Self {
        Self {
            leverage: Decimal::from(leverage.max(1)),
        }
    }

    /// Build a plan from the budgets allocated to a strategy.
    ///
    /// Each eligible user buys `budget * leverage / price`; the sum is floored
    /// to the symbol's step size and each user owns `budget / total_budget` of it.
    pub fn plan(
        &self,
        budgets: &[UserBudget],
        price: Decimal,
        rules: &SymbolRules,
    ) -> Result<SizingPlan, SizingRejection> {
        if price <= Decimal::ZERO {
            return Err(SizingRejection::InvalidPrice(price));
        }

        let eligible: Vec<&UserBudget> = budgets.iter().filter(|b| b.is_eligible()).collect();
        if eligible.is_empty() {
            return Err(SizingRejection::NoEligibleUsers);
        }

        let total_budget: Decimal = eligible.iter().map(|b| b.budget).sum();
        let raw_quantity: Decimal = eligible
            .iter()
            .map(|b| b.budget * self.leverage / price)
            .sum();
        let quantity = rules.floor_qty(raw_quantity);

        if quantity <= Decimal::ZERO || quantity < rules.min_qty {
            return Err(SizingRejection::BelowMinQty {
                quantity,
                min_qty: rules.min_qty,
            });
        }

        let notional = quantity * price;
        if notional < rules.min_notional {
            return Err(SizingRejection::BelowMinNotional {
                notional,
                min_notional: rules.min_notional,
            });
        }

        let shares: Vec<NewUserOrder> = eligible
            .iter()
            .map(|b| {
                let contribution = b.budget / total_budget;
                NewUserOrder {
                    user_id: b.user_id,
                    contribution_percent: contribution,
                    commission_percent: b.commission_percent,
                    quantity: quantity * contribution,
                }
            })
            .collect();

        let plan = SizingPlan {
            quantity,
            price,
            total_budget,
            shares,
        };

        let total = plan.contribution_total();
        if !contributions_balanced(total) {
            return Err(SizingRejection::ContributionDrift(total));
        }

        Ok(plan)
    }
}
