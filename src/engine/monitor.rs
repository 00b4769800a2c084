//! Target monitor: turns price ticks into target advances.

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::db::Database;
use crate::models::Order;

use super::dedup::target_key;
use super::lifecycle::{AdvanceOutcome, OrderManager};

pub struct TargetMonitor {
    db: Arc<Database>,
    manager: Arc<OrderManager>,
}

impl TargetMonitor {
    pub fn new(db: Arc<Database>, manager: Arc<OrderManager>) -> Self {
        Self { db, manager }
    }

    /// Tick for an exchange symbol. Unknown symbols are ignored.
    pub async fn on_symbol_price(&self, symbol: &str, price: Decimal) -> Result<Vec<(String, AdvanceOutcome)>> {
        match self.db.token_by_symbol(symbol).await? {
            Some(token) => self.on_price(token.id, price).await,
            None => {
                debug!(symbol = %symbol, "Tick for untracked symbol");
                Ok(Vec::new())
            }
        }
    }

    /// Check every active order of a token against its active target.
    /// Returns the orders whose target was crossed and what happened to them.
    pub async fn on_price(&self, token_id: i64, price: Decimal) -> Result<Vec<(String, AdvanceOutcome)>> {
        let orders = self.db.active_orders_for_token(token_id).await?;

        let checks = join_all(orders.iter().map(|order| self.check_order(order, price))).await;

        let mut crossed = Vec::new();
        for (order, result) in orders.iter().zip(checks) {
            match result {
                Ok(Some(outcome)) => crossed.push((order.order_id.clone(), outcome)),
                Ok(None) => {}
                Err(e) => warn!(order_id = %order.order_id, error = %e, "Target check failed"),
            }
        }

        Ok(crossed)
    }

    async fn check_order(&self, order: &Order, price: Decimal) -> Result<Option<AdvanceOutcome>> {
        let targets = self.db.targets(order.strategy_id, order.token_id).await?;
        let Some(target) = targets.iter().find(|t| t.sequence == order.active_target) else {
            return Ok(None);
        };

        if !target.is_crossed(order.side, price) {
            return Ok(None);
        }

        let key = target_key(&order.order_id, target.id);
        let Some(_permit) = self.manager.guards().target.try_lock(&key) else {
            debug!(order_id = %order.order_id, target_id = target.id, "Target check in flight");
            return Ok(None);
        };

        debug!(
            order_id = %order.order_id,
            target = target.sequence,
            target_price = %target.price,
            price = %price,
            "Target crossed"
        );

        let outcome = self.manager.advance(&order.order_id, target).await?;
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lifecycle::CloseOutcome;
    use crate::models::{OrderSide, StrategyDirection};
    use crate::testkit::{self, MockExchange};
    use rust_decimal_macros::dec;

    async fn setup(side: OrderSide) -> (Arc<Database>, Arc<MockExchange>, TargetMonitor) {
        let db = Arc::new(testkit::database().await);
        testkit::seed_token(&db, 1).await;
        testkit::seed_strategy(&db, 10, StrategyDirection::Long, false, None).await;
        testkit::seed_user(&db, 1, dec!(1000)).await;
        let targets = match side {
            OrderSide::Buy => [(dec!(110), dec!(95)), (dec!(120), dec!(105))],
            OrderSide::Sell => [(dec!(90), dec!(105)), (dec!(80), dec!(95))],
        };
        testkit::seed_targets(&db, 10, 1, &targets).await;
        testkit::seed_order(&db, "ord-1", 1, 10, side, &[(1, dec!(1), dec!(10))]).await;

        let exchange = Arc::new(MockExchange::new(dec!(100)));
        let manager = Arc::new(testkit::order_manager(db.clone(), exchange.clone()));
        let monitor = TargetMonitor::new(db.clone(), manager);
        (db, exchange, monitor)
    }

    #[tokio::test]
    async fn test_no_crossing_no_action() {
        let (_db, exchange, monitor) = setup(OrderSide::Buy).await;
        assert!(monitor.on_price(1, dec!(109)).await.unwrap().is_empty());
        assert!(exchange.conditional_orders().is_empty());
    }

    #[tokio::test]
    async fn test_buy_crossing_advances_then_closes() {
        let (db, exchange, monitor) = setup(OrderSide::Buy).await;

        let crossed = monitor.on_price(1, dec!(111)).await.unwrap();
        assert_eq!(crossed.len(), 1);
        assert!(matches!(crossed[0].1, AdvanceOutcome::Moved { to_sequence: 1, .. }));
        assert_eq!(exchange.conditional_orders()[0].stop_price, dec!(105));

        // same price again: target 1 is not crossed yet
        assert!(monitor.on_price(1, dec!(111)).await.unwrap().is_empty());

        let crossed = monitor.on_price(1, dec!(121)).await.unwrap();
        assert!(matches!(
            crossed[0].1,
            AdvanceOutcome::Closed(CloseOutcome::Closed { .. })
        ));
        assert!(!db.get_order("ord-1").await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_sell_crosses_downwards() {
        let (_db, _exchange, monitor) = setup(OrderSide::Sell).await;
        assert!(monitor.on_price(1, dec!(95)).await.unwrap().is_empty());
        assert_eq!(monitor.on_price(1, dec!(90)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_held_target_is_skipped() {
        let (db, _exchange, monitor) = setup(OrderSide::Buy).await;
        let target = db.targets(10, 1).await.unwrap().remove(0);
        let _held = monitor
            .manager
            .guards()
            .target
            .try_lock(&target_key("ord-1", target.id))
            .unwrap();

        assert!(monitor.on_price(1, dec!(111)).await.unwrap().is_empty());
        assert_eq!(db.get_order("ord-1").await.unwrap().unwrap().active_target, 0);
    }

    #[tokio::test]
    async fn test_symbol_lookup() {
        let (_db, _exchange, monitor) = setup(OrderSide::Buy).await;
        assert_eq!(monitor.on_symbol_price(testkit::SYMBOL, dec!(111)).await.unwrap().len(), 1);
        assert!(monitor.on_symbol_price("DOGEUSDT", dec!(111)).await.unwrap().is_empty());
    }
}
