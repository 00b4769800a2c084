//! Order lifecycle: open, protect, advance through targets, close.
//!
//! Every entry point is safe to call concurrently and repeatedly:
//! - opens are serialized per (token, root strategy) by the open guard
//! - closes are serialized per order by the close guard, and the ACTIVE ->
//!   CLOSED write is conditional, so settlement runs at most once
//! - advances only apply while the crossed target is still the active one
//! - a stop placed for an order that closed meanwhile is withdrawn, either by
//!   the placing side (the order is no longer active) or by the close (the
//!   closed row still names a stop it did not handle)

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::db::{Database, NewOrder};
use crate::error::ExchangeError;
use crate::exchange::{ConditionalKind, Exchange, FillStatus, OrderUpdate};
use crate::models::{CloseReason, Order, OrderSide, OrderStatus, Strategy, Target, Token};

use super::dedup::{open_key, DedupGuards};
use super::ledger::{SettlementLedger, SettlementReport};
use super::retry::{self, FixedRetry};
use super::sizing::{PositionSizer, SizingRejection};

pub const UNPROTECTED_ORDER: &str = "UNPROTECTED_ORDER";
pub const SETTLEMENT_INCOMPLETE: &str = "SETTLEMENT_INCOMPLETE";
pub const UNTRACKED_POSITION: &str = "UNTRACKED_POSITION";

#[derive(Debug)]
pub enum ProtectionOutcome {
    Protected { stoploss_order_id: String },
    /// Placement was rejected or ran out of attempts; an alert was raised
    Unprotected { reason: String },
    /// The strategy has no target for this token
    NoTarget,
    /// The order closed while the stop was being placed; the stop was withdrawn
    Abandoned,
}

impl ProtectionOutcome {
    pub fn is_protected(&self) -> bool {
        matches!(self, Self::Protected { .. })
    }
}

#[derive(Debug)]
pub enum OpenOutcome {
    Opened {
        order_id: String,
        side: OrderSide,
        quantity: Decimal,
        entry_price: Decimal,
        protection: ProtectionOutcome,
    },
    /// Another open for the same token and root strategy is in flight
    InFlight,
    /// The strategy family already holds an active order
    FamilyActive,
    Skipped(SizingRejection),
}

#[derive(Debug)]
pub enum CloseOutcome {
    Closed {
        net_profit: Decimal,
        settlement: SettlementReport,
    },
    /// Another caller is closing this order
    AlreadyClosing,
    NotActive,
}

impl CloseOutcome {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

#[derive(Debug)]
pub enum AdvanceOutcome {
    /// The next target became active and its stop was placed
    Moved {
        to_sequence: i64,
        protection: ProtectionOutcome,
    },
    /// The last target was crossed
    Closed(CloseOutcome),
    /// The order already moved past this target or is no longer active
    Stale,
}

/// How a position is exited.
#[derive(Debug, Clone, Copy)]
pub enum Exit {
    /// Submit a closing market order
    Market,
    /// The protective stop already filled at this price
    Filled(Decimal),
}

pub struct OrderManager {
    db: Arc<Database>,
    exchange: Arc<dyn Exchange>,
    guards: Arc<DedupGuards>,
    ledger: SettlementLedger,
    sizer: PositionSizer,
    retry_delay: Duration,
    max_retry: u32,
}

impl OrderManager {
    pub fn new(
        db: Arc<Database>,
        exchange: Arc<dyn Exchange>,
        guards: Arc<DedupGuards>,
        config: &EngineConfig,
    ) -> Self {
        let retry_delay = Duration::from_millis(config.retry_delay_ms);
        let ledger = SettlementLedger::new(db.clone(), retry_delay, config.settlement_max_retry);

        Self {
            db,
            exchange,
            guards,
            ledger,
            sizer: PositionSizer::new(config.leverage),
            retry_delay,
            max_retry: config.max_retry,
        }
    }

    pub fn guards(&self) -> &DedupGuards {
        &self.guards
    }

    async fn symbol_of(&self, token_id: i64) -> Result<String> {
        let token = self
            .db
            .get_token(token_id)
            .await?
            .with_context(|| format!("Unknown token {}", token_id))?;
        Ok(token.symbol())
    }

    /// Log and persist a condition an operator must act on.
    async fn raise_alert(&self, alert: &'static str, order_id: &str, message: &str) {
        error!(alert = alert, order_id = %order_id, message = %message, "Operator alert");

        let text = format!("{}: {}", alert, message);
        if let Err(e) = self.db.record_alert(order_id, &text).await {
            error!(order_id = %order_id, error = %e, "Failed to record operator alert");
        }
    }

    // ==================== Open ====================

    /// Open one pooled order for a root strategy and place its first stop.
    pub async fn open(&self, token: &Token, strategy: &Strategy, side: OrderSide) -> Result<OpenOutcome> {
        self.open_guarded(token, strategy, side, None).await
    }

    /// Like [`OrderManager::open`], but only when none of the `family`
    /// strategies holds an active order on `token`. The check runs under the
    /// open guard, so interleaved evaluations of one root open at most once.
    pub async fn open_exclusive(
        &self,
        token: &Token,
        strategy: &Strategy,
        side: OrderSide,
        family: &[i64],
    ) -> Result<OpenOutcome> {
        self.open_guarded(token, strategy, side, Some(family)).await
    }

    async fn open_guarded(
        &self,
        token: &Token,
        strategy: &Strategy,
        side: OrderSide,
        family: Option<&[i64]>,
    ) -> Result<OpenOutcome> {
        let key = open_key(token.id, strategy.id);
        let Some(_permit) = self.guards.open.try_lock(&key) else {
            info!(token = %token.name, strategy_id = strategy.id, "Open already in flight, skipping");
            return Ok(OpenOutcome::InFlight);
        };

        if let Some(family) = family {
            if !self.db.active_orders_for_strategies(token.id, family).await?.is_empty() {
                debug!(token = %token.name, strategy_id = strategy.id, "Family already has an active order");
                return Ok(OpenOutcome::FamilyActive);
            }
        }

        let symbol = token.symbol();
        let budgets = self.db.user_budgets(strategy.id).await?;
        let price = self
            .exchange
            .last_price(&symbol)
            .await
            .with_context(|| format!("Failed to fetch price for {}", symbol))?;
        let rules = self
            .exchange
            .symbol_rules(&symbol)
            .await
            .with_context(|| format!("Failed to fetch rules for {}", symbol))?;

        let plan = match self.sizer.plan(&budgets, price, &rules) {
            Ok(plan) => plan,
            Err(rejection) => {
                warn!(
                    symbol = %symbol,
                    strategy_id = strategy.id,
                    reason = %rejection,
                    "Order not sized"
                );
                return Ok(OpenOutcome::Skipped(rejection));
            }
        };

        let placed = self
            .exchange
            .place_order(&symbol, side, plan.quantity)
            .await
            .with_context(|| format!("Failed to open {} {} {}", side, plan.quantity, symbol))?;

        let entry_price = if placed.avg_price > Decimal::ZERO {
            placed.avg_price
        } else {
            price
        };

        let new_order = NewOrder {
            order_id: placed.order_id.clone(),
            token_id: token.id,
            strategy_id: strategy.id,
            side,
            quantity: plan.quantity,
            entry_price,
        };

        if let Err(e) = self.db.insert_order(&new_order, &plan.shares).await {
            let message = format!("exchange accepted the order but it was not persisted: {:#}", e);
            self.raise_alert(UNTRACKED_POSITION, &placed.order_id, &message).await;
            return Err(e);
        }

        info!(
            order_id = %placed.order_id,
            symbol = %symbol,
            side = %side,
            quantity = %plan.quantity,
            entry_price = %entry_price,
            users = plan.shares.len(),
            "Order opened"
        );

        let order = self
            .db
            .get_order(&placed.order_id)
            .await?
            .context("Opened order missing from database")?;

        let targets = self.db.targets(strategy.id, token.id).await?;
        let protection = match targets.first() {
            Some(first) => self.protect(&order, first).await?,
            None => ProtectionOutcome::NoTarget,
        };

        Ok(OpenOutcome::Opened {
            order_id: placed.order_id,
            side,
            quantity: plan.quantity,
            entry_price,
            protection,
        })
    }

    // ==================== Protect ====================

    /// Place the stop of `target` for an order, retrying transient failures.
    pub async fn protect(&self, order: &Order, target: &Target) -> Result<ProtectionOutcome> {
        let symbol = self.symbol_of(order.token_id).await?;
        let side = order.side.opposite();
        let quantity = order.quantity;
        let stop_price = target.stop_price;

        let attempts = AtomicU32::new(0);
        let exchange = self.exchange.as_ref();
        let (symbol_ref, attempts_ref) = (symbol.as_str(), &attempts);

        let result = backoff::future::retry_notify(
            FixedRetry::new(self.retry_delay, self.max_retry),
            move || async move {
                attempts_ref.fetch_add(1, Ordering::SeqCst);
                exchange
                    .place_conditional_order(symbol_ref, side, ConditionalKind::Stop, quantity, stop_price)
                    .await
                    .map_err(retry::classify)
            },
            |err: ExchangeError, wait: Duration| {
                warn!(
                    order_id = %order.order_id,
                    error = %err,
                    retry_in_ms = wait.as_millis() as u64,
                    "Stoploss placement failed, retrying"
                );
            },
        )
        .await;

        match result {
            Ok(stoploss_order_id) => {
                if !self
                    .db
                    .set_protection(&order.order_id, Some(&stoploss_order_id), true)
                    .await?
                {
                    info!(
                        order_id = %order.order_id,
                        stoploss_order_id = %stoploss_order_id,
                        "Order closed while its stoploss was placed, withdrawing it"
                    );
                    self.withdraw_stop(&symbol, &order.order_id, &stoploss_order_id).await;
                    return Ok(ProtectionOutcome::Abandoned);
                }
                info!(
                    order_id = %order.order_id,
                    stoploss_order_id = %stoploss_order_id,
                    stop_price = %stop_price,
                    target = target.sequence,
                    "Stoploss placed"
                );
                Ok(ProtectionOutcome::Protected { stoploss_order_id })
            }
            Err(e) => {
                if !self.db.set_protection(&order.order_id, None, false).await? {
                    debug!(order_id = %order.order_id, "Order closed before its stoploss was placed");
                    return Ok(ProtectionOutcome::Abandoned);
                }
                let reason = format!(
                    "stoploss at {} not placed after {} attempt(s): {}",
                    stop_price,
                    attempts.load(Ordering::SeqCst),
                    e
                );
                self.raise_alert(UNPROTECTED_ORDER, &order.order_id, &reason).await;
                Ok(ProtectionOutcome::Unprotected { reason })
            }
        }
    }

    // ==================== Advance ====================

    /// React to `target` being crossed: move the stop to the next target, or
    /// close the order when `target` was the last one.
    pub async fn advance(&self, order_id: &str, target: &Target) -> Result<AdvanceOutcome> {
        let Some(order) = self.db.get_order(order_id).await? else {
            return Ok(AdvanceOutcome::Stale);
        };
        if !order.is_active() || order.active_target != target.sequence {
            debug!(order_id = %order_id, target = target.sequence, "Target already handled");
            return Ok(AdvanceOutcome::Stale);
        }

        let targets = self.db.targets(order.strategy_id, order.token_id).await?;
        let Some(next) = targets.iter().find(|t| t.sequence > target.sequence) else {
            info!(order_id = %order_id, target = target.sequence, "Final target reached");
            let outcome = self.close(order_id, CloseReason::FinalTarget).await?;
            return Ok(AdvanceOutcome::Closed(outcome));
        };

        // claim the move before touching the exchange so a concurrent tick backs off
        if !self.db.advance_target(order_id, target.sequence, next.sequence).await? {
            return Ok(AdvanceOutcome::Stale);
        }

        if let Some(previous) = &order.stoploss_order_id {
            let symbol = self.symbol_of(order.token_id).await?;
            self.withdraw_stop(&symbol, order_id, previous).await;
        }

        info!(
            order_id = %order_id,
            from = target.sequence,
            to = next.sequence,
            "Target crossed, moving stoploss"
        );

        let protection = self.protect(&order, next).await?;
        Ok(AdvanceOutcome::Moved {
            to_sequence: next.sequence,
            protection,
        })
    }

    // ==================== Close ====================

    /// Close an order at market.
    pub async fn close(&self, order_id: &str, reason: CloseReason) -> Result<CloseOutcome> {
        self.close_with(order_id, reason, Exit::Market).await
    }

    /// Close an order and settle it. A no-op when another close is in flight
    /// or the order is no longer active.
    pub async fn close_with(&self, order_id: &str, reason: CloseReason, exit: Exit) -> Result<CloseOutcome> {
        let Some(_permit) = self.guards.close.try_lock(order_id) else {
            debug!(order_id = %order_id, "Close already in flight");
            return Ok(CloseOutcome::AlreadyClosing);
        };

        let Some(order) = self.db.get_order(order_id).await? else {
            return Ok(CloseOutcome::NotActive);
        };
        if !order.is_active() {
            return Ok(CloseOutcome::NotActive);
        }

        let symbol = self.symbol_of(order.token_id).await?;
        let mut withdrawn: Option<String> = None;

        let net_profit = match exit {
            Exit::Market => {
                if let Some(stop) = &order.stoploss_order_id {
                    self.withdraw_stop(&symbol, order_id, stop).await;
                    withdrawn = Some(stop.clone());
                }
                self.exchange
                    .close_market(&symbol, order.side, order.quantity)
                    .await
                    .with_context(|| format!("Failed to close order {}", order_id))?
            }
            Exit::Filled(price) => order.pnl_at(price),
        };

        let Some(closed) = self.db.mark_order_closed(order_id, net_profit, reason).await? else {
            warn!(order_id = %order_id, "Order left ACTIVE state during close");
            return Ok(CloseOutcome::NotActive);
        };

        // a target advance may have swapped in a new stop while the position
        // was closed; cancelling a stop that already filled is a no-op
        if let Some(stop) = closed.stoploss_order_id.as_deref() {
            if withdrawn.as_deref() != Some(stop) {
                self.withdraw_stop(&symbol, order_id, stop).await;
            }
        }

        info!(
            order_id = %order_id,
            reason = ?reason,
            net_profit = %net_profit,
            "Order closed"
        );

        let settlement = self.settle_and_report(&closed, net_profit).await;

        Ok(CloseOutcome::Closed {
            net_profit,
            settlement,
        })
    }

    /// Cancel a stoploss. Failures are logged, the stop may already be gone.
    async fn withdraw_stop(&self, symbol: &str, order_id: &str, stoploss_order_id: &str) {
        if let Err(e) = self
            .exchange
            .cancel_orders(symbol, &[stoploss_order_id.to_string()])
            .await
        {
            warn!(order_id = %order_id, stoploss_order_id = %stoploss_order_id, error = %e, "Failed to cancel stoploss");
        }
    }

    async fn settle_and_report(&self, order: &Order, net_profit: Decimal) -> SettlementReport {
        match self.ledger.settle(order, net_profit).await {
            Ok(report) => {
                if report.failed() > 0 {
                    let message = format!("{} user settlement(s) failed", report.failed());
                    self.raise_alert(SETTLEMENT_INCOMPLETE, &order.order_id, &message).await;
                }
                report
            }
            Err(e) => {
                self.raise_alert(SETTLEMENT_INCOMPLETE, &order.order_id, &format!("{:#}", e)).await;
                SettlementReport {
                    order_id: order.order_id.clone(),
                    results: Vec::new(),
                }
            }
        }
    }

    // ==================== Settlement recovery ====================

    /// Re-run settlement of a closed order. Shares settled earlier are left
    /// untouched. Returns `None` when the order is unknown, still active, or
    /// being closed right now.
    pub async fn settle_closed(&self, order_id: &str) -> Result<Option<SettlementReport>> {
        let Some(_permit) = self.guards.close.try_lock(order_id) else {
            debug!(order_id = %order_id, "Close in flight, settlement left to it");
            return Ok(None);
        };

        let Some(order) = self.db.get_order(order_id).await? else {
            return Ok(None);
        };
        if order.status != OrderStatus::Closed {
            return Ok(None);
        }

        let report = self.settle_and_report(&order, order.net_profit).await;
        info!(
            order_id = %order_id,
            applied = report.applied(),
            failed = report.failed(),
            "Settlement resumed"
        );
        Ok(Some(report))
    }

    /// Finish every closed order that still has unsettled shares.
    pub async fn settle_pending(&self) -> Result<Vec<SettlementReport>> {
        let orders = self.db.unsettled_closed_orders().await?;
        if !orders.is_empty() {
            warn!(orders = orders.len(), "Closed orders with unsettled shares found");
        }

        let mut reports = Vec::new();
        for order in orders {
            match self.settle_closed(&order.order_id).await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => warn!(order_id = %order.order_id, error = %e, "Failed to resume settlement"),
            }
        }
        Ok(reports)
    }

    // ==================== Exchange events ====================

    /// Apply a status change of a protective stop.
    ///
    /// A fill closes the order at the fill price. A cancel or expiry that the
    /// engine did not initiate leaves the order unprotected. Updates for ids
    /// that are not a live stop are ignored.
    pub async fn handle_order_update(&self, update: &OrderUpdate) -> Result<Option<CloseOutcome>> {
        let Some(order) = self.db.find_order_by_stoploss(&update.order_id).await? else {
            debug!(order_id = %update.order_id, status = ?update.status, "Update for untracked order");
            return Ok(None);
        };

        match update.status {
            FillStatus::Filled => {
                let fill_price = match update.avg_price {
                    Some(price) => price,
                    None => {
                        let symbol = self.symbol_of(order.token_id).await?;
                        self.exchange.last_price(&symbol).await?
                    }
                };
                info!(
                    order_id = %order.order_id,
                    stoploss_order_id = %update.order_id,
                    fill_price = %fill_price,
                    "Stoploss filled"
                );
                let outcome = self
                    .close_with(&order.order_id, CloseReason::StoplossFilled, Exit::Filled(fill_price))
                    .await?;
                Ok(Some(outcome))
            }
            FillStatus::Canceled | FillStatus::Expired | FillStatus::Rejected => {
                // a close in flight cancels the stop itself
                if self.guards.close.is_held(&order.order_id) {
                    return Ok(None);
                }
                if !self.db.set_protection(&order.order_id, None, false).await? {
                    return Ok(None);
                }
                let reason = format!("stoploss {} ended as {:?}", update.order_id, update.status);
                self.raise_alert(UNPROTECTED_ORDER, &order.order_id, &reason).await;
                Ok(None)
            }
            FillStatus::New | FillStatus::PartiallyFilled => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ledger::SettlementStatus;
    use crate::models::StrategyDirection;
    use crate::testkit::{self, MockExchange, StopMode};
    use rust_decimal_macros::dec;

    struct Fixture {
        db: Arc<Database>,
        exchange: Arc<MockExchange>,
        manager: Arc<OrderManager>,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(testkit::database().await);
        testkit::seed_token(&db, 1).await;
        testkit::seed_strategy(&db, 10, StrategyDirection::Long, false, None).await;
        db.bind_token_strategy(1, 10).await.unwrap();
        testkit::seed_targets(
            &db,
            10,
            1,
            &[(dec!(110), dec!(95)), (dec!(120), dec!(105)), (dec!(130), dec!(115))],
        )
        .await;
        testkit::seed_user(&db, 1, dec!(1000)).await;
        testkit::seed_user(&db, 2, dec!(1000)).await;
        testkit::seed_budget(&db, 1, 10, dec!(600), dec!(10)).await;
        testkit::seed_budget(&db, 2, 10, dec!(400), dec!(20)).await;

        let exchange = Arc::new(MockExchange::new(dec!(100)));
        let manager = Arc::new(testkit::order_manager(db.clone(), exchange.clone()));

        Fixture {
            db,
            exchange,
            manager,
        }
    }

    async fn open(f: &Fixture) -> String {
        let token = f.db.get_token(1).await.unwrap().unwrap();
        let strategy = f.db.get_strategy(10).await.unwrap().unwrap();
        match f.manager.open(&token, &strategy, OrderSide::Buy).await.unwrap() {
            OpenOutcome::Opened { order_id, .. } => order_id,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_persists_shares_and_protects() {
        let f = fixture().await;
        let order_id = open(&f).await;

        let order = f.db.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.quantity, dec!(10));
        assert_eq!(order.entry_price, dec!(100));
        assert!(order.is_protected);
        assert!(order.stoploss_order_id.is_some());

        let shares = f.db.user_orders(&order_id).await.unwrap();
        let total: Decimal = shares.iter().map(|s| s.contribution_percent).sum();
        assert_eq!(shares.len(), 2);
        assert!((total - Decimal::ONE).abs() <= dec!(0.000001));

        let stops = f.exchange.conditional_orders();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].stop_price, dec!(95));
        assert_eq!(stops[0].side, OrderSide::Sell);
        assert_eq!(stops[0].kind, ConditionalKind::Stop);
        assert_eq!(stops[0].quantity, dec!(10));
        assert_eq!(
            order.stoploss_order_id.as_deref(),
            Some(stops[0].order_id.as_str())
        );
    }

    #[tokio::test]
    async fn test_open_skipped_while_in_flight() {
        let f = fixture().await;
        let token = f.db.get_token(1).await.unwrap().unwrap();
        let strategy = f.db.get_strategy(10).await.unwrap().unwrap();

        let _held = f.manager.guards().open.try_lock(&open_key(1, 10)).unwrap();
        let outcome = f.manager.open(&token, &strategy, OrderSide::Buy).await.unwrap();

        assert!(matches!(outcome, OpenOutcome::InFlight));
        assert_eq!(f.exchange.market_order_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_leaves_order_unprotected() {
        let f = fixture().await;
        f.exchange.set_stop_mode(StopMode::AlwaysTransient);

        let order_id = open(&f).await;

        assert_eq!(f.exchange.stop_attempts(), 3);
        let order = f.db.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Active);
        assert!(!order.is_protected);
        assert!(order.stoploss_order_id.is_none());

        let alerts = f.db.alerts(10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].order_id, order_id);
        assert!(alerts[0].message.starts_with(UNPROTECTED_ORDER));
    }

    #[tokio::test]
    async fn test_rejected_stop_is_not_retried() {
        let f = fixture().await;
        f.exchange.set_stop_mode(StopMode::Reject);

        let order_id = open(&f).await;

        assert_eq!(f.exchange.stop_attempts(), 1);
        let order = f.db.get_order(&order_id).await.unwrap().unwrap();
        assert!(order.is_active());
        assert!(!order.is_protected);
        assert_eq!(f.db.alerts(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let f = fixture().await;
        f.exchange.set_stop_mode(StopMode::FailTimes(2));

        let order_id = open(&f).await;

        assert_eq!(f.exchange.stop_attempts(), 3);
        assert!(f.db.get_order(&order_id).await.unwrap().unwrap().is_protected);
        assert!(f.db.alerts(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_advance_moves_stop_then_closes_on_last_target() {
        let f = fixture().await;
        let order_id = open(&f).await;
        let targets = f.db.targets(10, 1).await.unwrap();
        let first_stop = f.db.get_order(&order_id).await.unwrap().unwrap().stoploss_order_id.unwrap();

        match f.manager.advance(&order_id, &targets[0]).await.unwrap() {
            AdvanceOutcome::Moved { to_sequence, protection } => {
                assert_eq!(to_sequence, 1);
                assert!(protection.is_protected());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.exchange.cancelled().contains(&first_stop));
        assert_eq!(f.exchange.conditional_orders()[1].stop_price, dec!(105));

        // duplicate tick for the same target
        assert!(matches!(
            f.manager.advance(&order_id, &targets[0]).await.unwrap(),
            AdvanceOutcome::Stale
        ));

        f.manager.advance(&order_id, &targets[1]).await.unwrap();
        f.exchange.set_close_pnl(dec!(300));
        match f.manager.advance(&order_id, &targets[2]).await.unwrap() {
            AdvanceOutcome::Closed(CloseOutcome::Closed { net_profit, .. }) => {
                assert_eq!(net_profit, dec!(300))
            }
            other => panic!("unexpected {:?}", other),
        }

        let order = f.db.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.close_reason, Some(CloseReason::FinalTarget));
    }

    #[tokio::test]
    async fn test_close_settles_once() {
        let f = fixture().await;
        let order_id = open(&f).await;
        f.exchange.set_close_pnl(dec!(1000));

        let first = f.manager.close(&order_id, CloseReason::Manual).await.unwrap();
        let second = f.manager.close(&order_id, CloseReason::Manual).await.unwrap();

        assert!(first.is_closed());
        assert!(matches!(second, CloseOutcome::NotActive));
        assert_eq!(f.exchange.close_count(), 1);

        let a = f.db.get_user(1).await.unwrap().unwrap();
        assert_eq!(a.profit, dec!(600));
        assert_eq!(a.commission, dec!(60));
        let b = f.db.get_user(2).await.unwrap().unwrap();
        assert_eq!(b.profit, dec!(400));
        assert_eq!(b.commission, dec!(80));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_and_fill_settle_once() {
        let f = fixture().await;
        let order_id = open(&f).await;
        let stop_id = f.db.get_order(&order_id).await.unwrap().unwrap().stoploss_order_id.unwrap();
        f.exchange.set_close_pnl(dec!(100));
        f.exchange.set_close_delay(Duration::from_millis(50));

        let evaluator_path = {
            let manager = f.manager.clone();
            let order_id = order_id.clone();
            tokio::spawn(async move { manager.close(&order_id, CloseReason::NewCandle).await })
        };
        let fill_path = {
            let manager = f.manager.clone();
            let update = OrderUpdate {
                order_id: stop_id,
                status: FillStatus::Filled,
                avg_price: Some(dec!(95)),
            };
            tokio::spawn(async move { manager.handle_order_update(&update).await })
        };

        let closed = evaluator_path.await.unwrap().unwrap();
        let filled = fill_path.await.unwrap().unwrap();

        let closes = [Some(&closed), filled.as_ref()]
            .into_iter()
            .flatten()
            .filter(|o| o.is_closed())
            .count();
        assert_eq!(closes, 1);

        let activities = f.db.activities_for_user(1).await.unwrap();
        assert_eq!(activities.len(), 1);
        assert_eq!(f.db.notifications_for_order(&order_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_fill_closes_at_fill_price() {
        let f = fixture().await;
        let order_id = open(&f).await;
        let stop_id = f.db.get_order(&order_id).await.unwrap().unwrap().stoploss_order_id.unwrap();

        let update = OrderUpdate {
            order_id: stop_id.clone(),
            status: FillStatus::Filled,
            avg_price: Some(dec!(95)),
        };
        let outcome = f.manager.handle_order_update(&update).await.unwrap();

        match outcome {
            Some(CloseOutcome::Closed { net_profit, .. }) => assert_eq!(net_profit, dec!(-50)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.exchange.close_count(), 0);

        // redelivery of the same event
        assert!(f.manager.handle_order_update(&update).await.unwrap().is_none());
        assert_eq!(f.db.activities_for_user(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_external_cancel_marks_unprotected() {
        let f = fixture().await;
        let order_id = open(&f).await;
        let stop_id = f.db.get_order(&order_id).await.unwrap().unwrap().stoploss_order_id.unwrap();

        let update = OrderUpdate {
            order_id: stop_id,
            status: FillStatus::Canceled,
            avg_price: None,
        };
        assert!(f.manager.handle_order_update(&update).await.unwrap().is_none());

        let order = f.db.get_order(&order_id).await.unwrap().unwrap();
        assert!(order.is_active());
        assert!(!order.is_protected);
        assert_eq!(f.db.alerts(10).await.unwrap().len(), 1);
    }

    fn live_stops(exchange: &MockExchange) -> Vec<String> {
        let cancelled = exchange.cancelled();
        exchange
            .conditional_orders()
            .into_iter()
            .map(|stop| stop.order_id)
            .filter(|id| !cancelled.contains(id))
            .collect()
    }

    #[tokio::test]
    async fn test_advance_during_close_leaves_no_live_stop() {
        let f = fixture().await;
        let order_id = open(&f).await;
        let targets = f.db.targets(10, 1).await.unwrap();
        f.exchange.set_close_delay(Duration::from_millis(100));

        let closing = {
            let manager = f.manager.clone();
            let order_id = order_id.clone();
            tokio::spawn(async move { manager.close(&order_id, CloseReason::NewCandle).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the close is waiting on the exchange while the target is crossed
        let advanced = f.manager.advance(&order_id, &targets[0]).await.unwrap();
        assert!(matches!(advanced, AdvanceOutcome::Moved { .. }));
        assert!(closing.await.unwrap().unwrap().is_closed());

        let order = f.db.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Closed);
        assert_eq!(f.exchange.conditional_orders().len(), 2);
        assert!(live_stops(&f.exchange).is_empty(), "live stops: {:?}", live_stops(&f.exchange));
    }

    #[tokio::test]
    async fn test_stop_placed_after_close_is_withdrawn() {
        let f = fixture().await;
        let order_id = open(&f).await;
        let snapshot = f.db.get_order(&order_id).await.unwrap().unwrap();
        let targets = f.db.targets(10, 1).await.unwrap();

        assert!(f.manager.close(&order_id, CloseReason::Manual).await.unwrap().is_closed());
        let outcome = f.manager.protect(&snapshot, &targets[1]).await.unwrap();

        assert!(matches!(outcome, ProtectionOutcome::Abandoned));
        assert!(live_stops(&f.exchange).is_empty());
        assert!(f.db.alerts(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_settlement_is_resumed() {
        let f = fixture().await;
        let order_id = open(&f).await;
        f.exchange.set_close_pnl(dec!(1000));

        sqlx::query(
            "CREATE TRIGGER hold_user_2 BEFORE UPDATE ON users WHEN NEW.id = 2 BEGIN SELECT RAISE(ABORT, 'user locked'); END",
        )
        .execute(f.db.pool())
        .await
        .unwrap();

        match f.manager.close(&order_id, CloseReason::Manual).await.unwrap() {
            CloseOutcome::Closed { settlement, .. } => {
                assert_eq!(settlement.applied(), 1);
                assert_eq!(settlement.failed(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        let alerts = f.db.alerts(10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].message.starts_with(SETTLEMENT_INCOMPLETE));
        assert_eq!(f.db.unsettled_closed_orders().await.unwrap().len(), 1);
        assert_eq!(f.db.get_user(2).await.unwrap().unwrap().profit, dec!(0));

        sqlx::query("DROP TRIGGER hold_user_2")
            .execute(f.db.pool())
            .await
            .unwrap();

        let reports = f.manager.settle_pending().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].applied(), 1);
        assert_eq!(
            reports[0].for_user(1).unwrap().status,
            SettlementStatus::AlreadySettled
        );

        let a = f.db.get_user(1).await.unwrap().unwrap();
        assert_eq!(a.profit, dec!(600));
        let b = f.db.get_user(2).await.unwrap().unwrap();
        assert_eq!(b.profit, dec!(400));
        assert_eq!(b.commission, dec!(80));
        assert!(f.db.unsettled_closed_orders().await.unwrap().is_empty());

        // nothing left to do
        assert!(f.manager.settle_pending().await.unwrap().is_empty());
        assert!(f.manager.settle_closed("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exclusive_open_rechecks_family() {
        let f = fixture().await;
        let token = f.db.get_token(1).await.unwrap().unwrap();
        let strategy = f.db.get_strategy(10).await.unwrap().unwrap();
        testkit::seed_order(&f.db, "existing", 1, 10, OrderSide::Buy, &[(1, dec!(1), dec!(10))]).await;

        let outcome = f
            .manager
            .open_exclusive(&token, &strategy, OrderSide::Buy, &[10])
            .await
            .unwrap();
        assert!(matches!(outcome, OpenOutcome::FamilyActive));
        assert_eq!(f.exchange.market_order_count(), 0);

        f.db.mark_order_closed("existing", Decimal::ZERO, CloseReason::Manual)
            .await
            .unwrap();
        let outcome = f
            .manager
            .open_exclusive(&token, &strategy, OrderSide::Buy, &[10])
            .await
            .unwrap();
        assert!(matches!(outcome, OpenOutcome::Opened { .. }));
    }
}
