//! Settlement ledger: splits a closed order's result across its participants.
//!
//! For every share of the order:
//! - `user_net_profit = contribution_percent * net_profit`
//! - `commission = user_net_profit * commission_percent / 100` when the order
//!   as a whole made money, otherwise zero
//! - the user's profit, commission and insurance grow by those amounts, and the
//!   available balance absorbs the result (a loss deeper than the available
//!   balance empties it and the rest is taken from the trade balance)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::db::{Database, SettlementWrite};
use crate::models::{NotificationKind, Order, UserOrder};

use super::retry::FixedRetry;
use super::sizing::contributions_balanced;

/// Amounts owed to one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSettlement {
    pub user_order_id: i64,
    pub user_id: i64,
    pub net_profit: Decimal,
    pub commission: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettlementStatus {
    Applied,
    /// The share had been settled by an earlier run
    AlreadySettled,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct SettlementResult {
    pub settlement: UserSettlement,
    pub status: SettlementStatus,
}

#[derive(Debug, Clone, Default)]
pub struct SettlementReport {
    pub order_id: String,
    pub results: Vec<SettlementResult>,
}

impl SettlementReport {
    pub fn applied(&self) -> usize {
        self.count(|s| *s == SettlementStatus::Applied)
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, SettlementStatus::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&SettlementStatus) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.status)).count()
    }

    pub fn for_user(&self, user_id: i64) -> Option<&SettlementResult> {
        self.results.iter().find(|r| r.settlement.user_id == user_id)
    }
}

/// Split `net_profit` across the shares of an order.
pub fn compute(net_profit: Decimal, shares: &[UserOrder]) -> Vec<UserSettlement> {
    shares
        .iter()
        .map(|share| {
            let user_net_profit = share.contribution_percent * net_profit;
            // the sign test is on the order total, not on the user's part
            let commission = if net_profit >= Decimal::ZERO {
                user_net_profit * share.commission_percent / Decimal::ONE_HUNDRED
            } else {
                Decimal::ZERO
            };

            UserSettlement {
                user_order_id: share.id,
                user_id: share.user_id,
                net_profit: user_net_profit,
                commission,
            }
        })
        .collect()
}

fn message(order_id: &str, amount: Decimal) -> String {
    match NotificationKind::for_amount(amount) {
        NotificationKind::Profit => format!("Order {} closed with a profit of {:.2}", order_id, amount),
        NotificationKind::Loss => format!("Order {} closed with a loss of {:.2}", order_id, amount.abs()),
    }
}

pub struct SettlementLedger {
    db: Arc<Database>,
    retry_delay: Duration,
    max_retry: u32,
}

impl SettlementLedger {
    pub fn new(db: Arc<Database>, retry_delay: Duration, max_retry: u32) -> Self {
        Self {
            db,
            retry_delay,
            max_retry,
        }
    }

    /// Settle every participant of a closed order.
    ///
    /// Users are settled concurrently and independently: one user's failure
    /// does not stop the others, and each write is retried on its own.
    pub async fn settle(&self, order: &Order, net_profit: Decimal) -> Result<SettlementReport> {
        let db = self.db.as_ref();
        let order_id = order.order_id.as_str();
        let shares = backoff::future::retry_notify(
            FixedRetry::new(self.retry_delay, self.max_retry),
            move || async move { db.user_orders(order_id).await.map_err(backoff::Error::transient) },
            |err: anyhow::Error, wait: Duration| {
                warn!(
                    order_id = %order_id,
                    error = %err,
                    retry_in_ms = wait.as_millis() as u64,
                    "Failed to load order shares, retrying"
                );
            },
        )
        .await?;

        let total: Decimal = shares.iter().map(|s| s.contribution_percent).sum();
        if !shares.is_empty() && !contributions_balanced(total) {
            warn!(
                order_id = %order.order_id,
                contribution_total = %total,
                "Contributions do not sum to one"
            );
        }

        let settlements = compute(net_profit, &shares);
        let results = join_all(
            settlements
                .into_iter()
                .map(|settlement| self.settle_user(&order.order_id, settlement)),
        )
        .await;

        let report = SettlementReport {
            order_id: order.order_id.clone(),
            results,
        };

        info!(
            order_id = %order.order_id,
            net_profit = %net_profit,
            users = report.results.len(),
            applied = report.applied(),
            failed = report.failed(),
            "Order settled"
        );

        Ok(report)
    }

    async fn settle_user(&self, order_id: &str, settlement: UserSettlement) -> SettlementResult {
        let text = message(order_id, settlement.net_profit);
        let write = SettlementWrite {
            user_order_id: settlement.user_order_id,
            user_id: settlement.user_id,
            order_id,
            net_profit: settlement.net_profit,
            commission: settlement.commission,
            message: &text,
        };

        let db = self.db.as_ref();
        let write = &write;
        let result = backoff::future::retry_notify(
            FixedRetry::new(self.retry_delay, self.max_retry),
            move || async move {
                db.settle_user_order(write)
                    .await
                    .map_err(backoff::Error::transient)
            },
            |err: anyhow::Error, wait: Duration| {
                warn!(
                    order_id = %order_id,
                    user_id = settlement.user_id,
                    error = %err,
                    retry_in_ms = wait.as_millis() as u64,
                    "Settlement write failed, retrying"
                );
            },
        )
        .await;

        let status = match result {
            Ok(Some(user)) => {
                debug!(
                    order_id = %order_id,
                    user_id = user.id,
                    net_profit = %settlement.net_profit,
                    commission = %settlement.commission,
                    available_balance = %user.available_balance,
                    trade_balance = %user.trade_balance,
                    "User settled"
                );
                SettlementStatus::Applied
            }
            Ok(None) => SettlementStatus::AlreadySettled,
            Err(e) => {
                error!(
                    order_id = %order_id,
                    user_id = settlement.user_id,
                    error = %e,
                    "Settlement failed"
                );
                SettlementStatus::Failed(format!("{:#}", e))
            }
        };

        SettlementResult { settlement, status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NotificationKind, OrderSide, StrategyDirection};
    use crate::testkit;
    use rust_decimal_macros::dec;

    fn share(id: i64, user_id: i64, contribution: Decimal, commission_percent: Decimal) -> UserOrder {
        UserOrder {
            id,
            user_id,
            order_id: "o".to_string(),
            contribution_percent: contribution,
            commission_percent,
            quantity: Decimal::ONE,
            commission: Decimal::ZERO,
            is_settled: false,
        }
    }

    #[test]
    fn test_compute_profit_split() {
        let shares = vec![share(1, 1, dec!(0.6), dec!(10)), share(2, 2, dec!(0.4), dec!(20))];
        let split = compute(dec!(1000), &shares);

        assert_eq!(split[0].net_profit, dec!(600));
        assert_eq!(split[0].commission, dec!(60));
        assert_eq!(split[1].net_profit, dec!(400));
        assert_eq!(split[1].commission, dec!(80));
    }

    #[test]
    fn test_compute_loss_has_no_commission() {
        let shares = vec![share(1, 1, dec!(0.5), dec!(10)), share(2, 2, dec!(0.5), dec!(10))];
        let split = compute(dec!(-300), &shares);

        assert_eq!(split[0].net_profit, dec!(-150));
        assert!(split.iter().all(|s| s.commission.is_zero()));
    }

    async fn ledger_with_order(users: &[(i64, Decimal, Decimal, Decimal)]) -> (Arc<Database>, Order) {
        let db = Arc::new(testkit::database().await);
        testkit::seed_token(&db, 1).await;
        testkit::seed_strategy(&db, 10, StrategyDirection::Long, false, None).await;
        for (user_id, available, _, _) in users {
            testkit::seed_user(&db, *user_id, *available).await;
        }
        let shares: Vec<(i64, Decimal, Decimal)> =
            users.iter().map(|(id, _, c, p)| (*id, *c, *p)).collect();
        testkit::seed_order(&db, "ord-1", 1, 10, OrderSide::Buy, &shares).await;
        let order = db.get_order("ord-1").await.unwrap().unwrap();
        (db, order)
    }

    #[tokio::test]
    async fn test_profit_split_is_applied() {
        let (db, order) = ledger_with_order(&[
            (1, dec!(1000), dec!(0.6), dec!(10)),
            (2, dec!(1000), dec!(0.4), dec!(20)),
        ])
        .await;
        let ledger = SettlementLedger::new(db.clone(), Duration::from_millis(1), 3);

        let report = ledger.settle(&order, dec!(1000)).await.unwrap();
        assert_eq!(report.applied(), 2);

        let a = db.get_user(1).await.unwrap().unwrap();
        assert_eq!(a.profit, dec!(600));
        assert_eq!(a.commission, dec!(60));
        assert_eq!(a.insurance, dec!(60));
        assert_eq!(a.available_balance, dec!(1600));

        let b = db.get_user(2).await.unwrap().unwrap();
        assert_eq!(b.profit, dec!(400));
        assert_eq!(b.commission, dec!(80));

        let shares = db.user_orders("ord-1").await.unwrap();
        assert!(shares.iter().all(|s| s.is_settled));
        assert_eq!(shares[0].commission, dec!(60));

        let notifications = db.notifications_for_order("ord-1").await.unwrap();
        assert_eq!(notifications.len(), 2);
        assert!(notifications.iter().all(|n| n.kind == NotificationKind::Profit));
    }

    #[tokio::test]
    async fn test_loss_absorbed_by_trade_balance() {
        let (db, order) = ledger_with_order(&[(1, dec!(200), dec!(1), dec!(10))]).await;
        let ledger = SettlementLedger::new(db.clone(), Duration::from_millis(1), 3);

        ledger.settle(&order, dec!(-300)).await.unwrap();

        let user = db.get_user(1).await.unwrap().unwrap();
        assert_eq!(user.available_balance, dec!(0));
        assert_eq!(user.trade_balance, dec!(-100));
        assert_eq!(user.commission, dec!(0));
        assert_eq!(user.profit, dec!(-300));

        let notifications = db.notifications_for_order("ord-1").await.unwrap();
        assert_eq!(notifications[0].kind, NotificationKind::Loss);
    }

    #[tokio::test]
    async fn test_settling_twice_credits_once() {
        let (db, order) = ledger_with_order(&[(1, dec!(100), dec!(1), dec!(10))]).await;
        let ledger = SettlementLedger::new(db.clone(), Duration::from_millis(1), 3);

        ledger.settle(&order, dec!(50)).await.unwrap();
        let second = ledger.settle(&order, dec!(50)).await.unwrap();

        assert_eq!(second.applied(), 0);
        assert_eq!(
            second.for_user(1).map(|r| r.status.clone()),
            Some(SettlementStatus::AlreadySettled)
        );
        assert_eq!(db.get_user(1).await.unwrap().unwrap().profit, dec!(50));
    }
}
