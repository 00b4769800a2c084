//! Daily strategy evaluation.
//!
//! Once per day every active token is evaluated: leverage is set, then each
//! qualifying root strategy either rolls its orders over (close everything,
//! open one new order) or opens an order when its family has none.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::exchange::{CandleSource, Exchange};
use crate::models::{CloseReason, Strategy, Token};

use super::lifecycle::{CloseOutcome, OpenOutcome, OrderManager};

/// What happened to one strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyReport {
    pub opened: bool,
    pub closed: usize,
    pub close_failures: usize,
}

/// What happened to one token.
#[derive(Debug, Clone, Default)]
pub struct TokenReport {
    pub strategies: usize,
    pub opened: usize,
    pub closed: usize,
    pub skipped: usize,
}

/// Outcome of a daily batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub evaluated: usize,
    pub opened: usize,
    pub closed: usize,
    pub skipped_strategies: usize,
    /// (token id, error) for tokens that could not be evaluated
    pub failed: Vec<(i64, String)>,
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Daily Evaluation ===")?;
        writeln!(f, "Tokens evaluated:    {}", self.evaluated)?;
        writeln!(f, "Orders opened:       {}", self.opened)?;
        writeln!(f, "Orders closed:       {}", self.closed)?;
        writeln!(f, "Strategies skipped:  {}", self.skipped_strategies)?;
        writeln!(f, "Tokens failed:       {}", self.failed.len())?;
        for (token_id, error) in &self.failed {
            writeln!(f, "  token {}: {}", token_id, error)?;
        }
        Ok(())
    }
}

pub struct StrategyEvaluator {
    db: Arc<Database>,
    exchange: Arc<dyn Exchange>,
    candles: Arc<dyn CandleSource>,
    manager: Arc<OrderManager>,
    leverage: u32,
    max_concurrent_tokens: usize,
}

impl StrategyEvaluator {
    pub fn new(
        db: Arc<Database>,
        exchange: Arc<dyn Exchange>,
        candles: Arc<dyn CandleSource>,
        manager: Arc<OrderManager>,
        leverage: u32,
        max_concurrent_tokens: usize,
    ) -> Self {
        Self {
            db,
            exchange,
            candles,
            manager,
            leverage,
            max_concurrent_tokens: max_concurrent_tokens.max(1),
        }
    }

    /// Evaluate every active token, at most `max_concurrent_tokens` at a time.
    /// All tokens are awaited; failures are collected rather than propagated.
    pub async fn run_daily(&self) -> Result<BatchReport> {
        let tokens = self.db.active_tokens().await?;
        info!(tokens = tokens.len(), "Starting daily evaluation");

        let results: Vec<(i64, Result<TokenReport>)> = stream::iter(tokens)
            .map(|token| async move {
                let result = self.evaluate_token(&token).await;
                (token.id, result)
            })
            .buffer_unordered(self.max_concurrent_tokens)
            .collect()
            .await;

        let mut report = BatchReport::default();
        for (token_id, result) in results {
            match result {
                Ok(token_report) => {
                    report.evaluated += 1;
                    report.opened += token_report.opened;
                    report.closed += token_report.closed;
                    report.skipped_strategies += token_report.skipped;
                }
                Err(e) => {
                    warn!(token_id = token_id, error = %e, "Token evaluation failed");
                    report.failed.push((token_id, format!("{:#}", e)));
                }
            }
        }

        info!(
            evaluated = report.evaluated,
            opened = report.opened,
            closed = report.closed,
            failed = report.failed.len(),
            "Daily evaluation complete"
        );

        Ok(report)
    }

    /// Evaluate a single token by id.
    pub async fn evaluate_token_id(&self, token_id: i64) -> Result<TokenReport> {
        let token = self
            .db
            .get_token(token_id)
            .await?
            .with_context(|| format!("Unknown token {}", token_id))?;
        self.evaluate_token(&token).await
    }

    /// Set leverage, then evaluate each qualifying root strategy in turn.
    /// A failing strategy is logged and skipped.
    pub async fn evaluate_token(&self, token: &Token) -> Result<TokenReport> {
        let symbol = token.symbol();
        self.exchange
            .set_leverage(&symbol, self.leverage)
            .await
            .with_context(|| format!("Failed to set leverage for {}", symbol))?;

        let strategies = self.db.qualifying_root_strategies(token.id).await?;
        let mut report = TokenReport {
            strategies: strategies.len(),
            ..Default::default()
        };

        for strategy in &strategies {
            match self.evaluate_strategy(token, strategy).await {
                Ok(result) => {
                    report.opened += usize::from(result.opened);
                    report.closed += result.closed;
                }
                Err(e) => {
                    warn!(
                        symbol = %symbol,
                        strategy_id = strategy.id,
                        error = %e,
                        "Strategy skipped"
                    );
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    pub async fn evaluate_strategy(&self, token: &Token, strategy: &Strategy) -> Result<StrategyReport> {
        let symbol = token.symbol();

        let mut family = vec![strategy.id];
        family.extend(self.db.child_strategy_ids(strategy.id).await?);
        let active = self.db.active_orders_for_strategies(token.id, &family).await?;

        let candles = self
            .candles
            .last_n_day_candles(&symbol, 1)
            .await
            .with_context(|| format!("Failed to fetch daily candle for {}", symbol))?;
        let side = strategy.direction.side_for(candles.last());

        debug!(
            symbol = %symbol,
            strategy_id = strategy.id,
            direction = ?strategy.direction,
            side = %side,
            active_orders = active.len(),
            "Evaluating strategy"
        );

        let mut report = StrategyReport::default();

        if strategy.is_close_before_new_candle {
            let closes = join_all(
                active
                    .iter()
                    .map(|order| self.manager.close(&order.order_id, CloseReason::NewCandle)),
            )
            .await;

            for (order, result) in active.iter().zip(closes) {
                match result {
                    Ok(CloseOutcome::Closed { .. }) => report.closed += 1,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(order_id = %order.order_id, error = %e, "Failed to close order before new candle");
                        report.close_failures += 1;
                    }
                }
            }
        } else if !active.is_empty() {
            debug!(strategy_id = strategy.id, "Family already has an active order");
            return Ok(report);
        }

        let outcome = if strategy.is_close_before_new_candle {
            self.manager.open(token, strategy, side).await?
        } else {
            self.manager.open_exclusive(token, strategy, side, &family).await?
        };

        match outcome {
            OpenOutcome::Opened { .. } => report.opened = true,
            OpenOutcome::InFlight | OpenOutcome::FamilyActive => {}
            OpenOutcome::Skipped(reason) => {
                info!(symbol = %symbol, strategy_id = strategy.id, reason = %reason, "No order opened");
            }
        }

        Ok(report)
    }
}
