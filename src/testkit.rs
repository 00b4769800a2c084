//! Test doubles and seed helpers shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::EngineConfig;
use crate::db::{BudgetEntry, Database, NewOrder, NewUserOrder};
use crate::engine::{DedupGuards, OrderManager};
use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::{
    CandleSource, ConditionalKind, Exchange, FillStatus, OrderUpdate, PlacedOrder, SymbolRules,
};
use crate::models::{Candle, OrderSide, Strategy, StrategyDirection, Target, Token, User};

/// Symbol of every seeded token.
pub const SYMBOL: &str = "BTCUSDT";

pub async fn database() -> Database {
    Database::new("sqlite::memory:").await.unwrap()
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        database_url: "sqlite::memory:".to_string(),
        retry_delay_ms: 1,
        ..EngineConfig::default()
    }
}

pub fn order_manager(db: Arc<Database>, exchange: Arc<dyn Exchange>) -> OrderManager {
    OrderManager::new(db, exchange, DedupGuards::new(), &test_config())
}

pub async fn seed_token(db: &Database, id: i64) {
    db.save_token(&Token {
        id,
        name: "BTC".to_string(),
        stable: "USDT".to_string(),
        is_active: true,
    })
    .await
    .unwrap();
}

pub async fn seed_strategy(
    db: &Database,
    id: i64,
    direction: StrategyDirection,
    is_close_before_new_candle: bool,
    root_id: Option<i64>,
) {
    db.save_strategy(&Strategy {
        id,
        name: format!("strategy-{}", id),
        direction,
        is_close_before_new_candle,
        is_active: true,
        root_id,
    })
    .await
    .unwrap();
}

/// Targets as (price, stop_price), in crossing order.
pub async fn seed_targets(db: &Database, strategy_id: i64, token_id: i64, levels: &[(Decimal, Decimal)]) {
    for (sequence, (price, stop_price)) in levels.iter().enumerate() {
        db.save_target(&Target {
            id: strategy_id * 100 + sequence as i64,
            strategy_id,
            token_id,
            sequence: sequence as i64,
            price: *price,
            stop_price: *stop_price,
        })
        .await
        .unwrap();
    }
}

pub async fn seed_user(db: &Database, id: i64, available_balance: Decimal) {
    db.save_user(&User {
        id,
        name: format!("user-{}", id),
        profit: Decimal::ZERO,
        commission: Decimal::ZERO,
        insurance: Decimal::ZERO,
        available_balance,
        trade_balance: Decimal::ZERO,
    })
    .await
    .unwrap();
}

pub async fn seed_budget(db: &Database, user_id: i64, strategy_id: i64, budget: Decimal, commission_percent: Decimal) {
    db.save_budget(&BudgetEntry {
        user_id,
        strategy_id,
        budget,
        commission_percent,
    })
    .await
    .unwrap();
}

/// Active order of 10 units at 100 with shares as (user_id, contribution, commission_percent).
pub async fn seed_order(
    db: &Database,
    order_id: &str,
    token_id: i64,
    strategy_id: i64,
    side: OrderSide,
    shares: &[(i64, Decimal, Decimal)],
) {
    let quantity = dec!(10);
    let order = NewOrder {
        order_id: order_id.to_string(),
        token_id,
        strategy_id,
        side,
        quantity,
        entry_price: dec!(100),
    };
    let shares: Vec<NewUserOrder> = shares
        .iter()
        .map(|(user_id, contribution, commission_percent)| NewUserOrder {
            user_id: *user_id,
            contribution_percent: *contribution,
            commission_percent: *commission_percent,
            quantity: quantity * contribution,
        })
        .collect();

    db.insert_order(&order, &shares).await.unwrap();
}

// ==================== Exchange ====================

/// How the mock answers stoploss placements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Accept,
    AlwaysTransient,
    Reject,
    /// Transient failures for the first n attempts, then accept
    FailTimes(u32),
}

#[derive(Debug, Clone)]
pub struct RecordedStop {
    pub order_id: String,
    pub side: OrderSide,
    pub kind: ConditionalKind,
    pub quantity: Decimal,
    pub stop_price: Decimal,
}

#[derive(Debug)]
struct MockState {
    price: Decimal,
    stop_mode: StopMode,
    close_pnl: Decimal,
    close_delay: Duration,
    market_orders: Vec<(OrderSide, Decimal)>,
    stops: Vec<RecordedStop>,
    cancelled: Vec<String>,
}

/// Scriptable exchange. Every order is accepted at the configured price.
pub struct MockExchange {
    state: Mutex<MockState>,
    next_id: AtomicU32,
    stop_attempts: AtomicU32,
    close_calls: AtomicU32,
    leverage_calls: AtomicU32,
    leverage_fails: AtomicBool,
}

impl MockExchange {
    pub fn new(price: Decimal) -> Self {
        Self {
            state: Mutex::new(MockState {
                price,
                stop_mode: StopMode::Accept,
                close_pnl: Decimal::ZERO,
                close_delay: Duration::ZERO,
                market_orders: Vec::new(),
                stops: Vec::new(),
                cancelled: Vec::new(),
            }),
            next_id: AtomicU32::new(0),
            stop_attempts: AtomicU32::new(0),
            close_calls: AtomicU32::new(0),
            leverage_calls: AtomicU32::new(0),
            leverage_fails: AtomicBool::new(false),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn next_order_id(&self) -> String {
        format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn set_stop_mode(&self, mode: StopMode) {
        self.state().stop_mode = mode;
    }

    pub fn set_close_pnl(&self, pnl: Decimal) {
        self.state().close_pnl = pnl;
    }

    pub fn set_close_delay(&self, delay: Duration) {
        self.state().close_delay = delay;
    }

    pub fn fail_leverage(&self) {
        self.leverage_fails.store(true, Ordering::SeqCst);
    }

    pub fn stop_attempts(&self) -> u32 {
        self.stop_attempts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn leverage_calls(&self) -> u32 {
        self.leverage_calls.load(Ordering::SeqCst)
    }

    pub fn market_order_count(&self) -> usize {
        self.state().market_orders.len()
    }

    /// Accepted stoploss orders, oldest first.
    pub fn conditional_orders(&self) -> Vec<RecordedStop> {
        self.state().stops.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> ExchangeResult<()> {
        self.leverage_calls.fetch_add(1, Ordering::SeqCst);
        if self.leverage_fails.load(Ordering::SeqCst) {
            return Err(ExchangeError::rejected(-4028, "Leverage is not valid"));
        }
        Ok(())
    }

    async fn place_order(&self, _symbol: &str, side: OrderSide, quantity: Decimal) -> ExchangeResult<PlacedOrder> {
        let order_id = self.next_order_id();
        let mut state = self.state();
        state.market_orders.push((side, quantity));
        Ok(PlacedOrder {
            order_id,
            avg_price: state.price,
        })
    }

    async fn place_conditional_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        kind: ConditionalKind,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> ExchangeResult<String> {
        let attempt = self.stop_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let mode = self.state().stop_mode;

        match mode {
            StopMode::AlwaysTransient => return Err(ExchangeError::Transient("timeout".into())),
            StopMode::Reject => return Err(ExchangeError::rejected(-2021, "Order would immediately trigger.")),
            StopMode::FailTimes(n) if attempt <= n => return Err(ExchangeError::Transient("timeout".into())),
            _ => {}
        }

        let order_id = self.next_order_id();
        self.state().stops.push(RecordedStop {
            order_id: order_id.clone(),
            side,
            kind,
            quantity,
            stop_price,
        });
        Ok(order_id)
    }

    async fn cancel_orders(&self, _symbol: &str, order_ids: &[String]) -> ExchangeResult<()> {
        self.state().cancelled.extend(order_ids.iter().cloned());
        Ok(())
    }

    async fn close_market(&self, _symbol: &str, _position_side: OrderSide, _quantity: Decimal) -> ExchangeResult<Decimal> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let (delay, pnl) = {
            let state = self.state();
            (state.close_delay, state.close_pnl)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(pnl)
    }

    async fn last_price(&self, _symbol: &str) -> ExchangeResult<Decimal> {
        Ok(self.state().price)
    }

    async fn symbol_rules(&self, _symbol: &str) -> ExchangeResult<SymbolRules> {
        Ok(SymbolRules {
            min_qty: dec!(0.001),
            step_size: dec!(0.001),
            min_notional: dec!(5),
        })
    }

    async fn order_status(&self, _symbol: &str, order_id: &str) -> ExchangeResult<OrderUpdate> {
        let status = if self.state().cancelled.iter().any(|id| id == order_id) {
            FillStatus::Canceled
        } else {
            FillStatus::New
        };
        Ok(OrderUpdate {
            order_id: order_id.to_string(),
            status,
            avg_price: None,
        })
    }
}

// ==================== Candles ====================

pub fn candle(open: Decimal, close: Decimal) -> Candle {
    Candle {
        open,
        high: open.max(close),
        low: open.min(close),
        close,
        volume: dec!(1000),
        date: Utc::now(),
    }
}

/// Candle source returning a fixed history, or failing on demand.
pub struct MockCandles {
    candles: Mutex<Vec<Candle>>,
    fails: AtomicBool,
}

impl MockCandles {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self {
            candles: Mutex::new(candles),
            fails: AtomicBool::new(false),
        }
    }

    pub fn bullish() -> Self {
        Self::new(vec![candle(dec!(100), dec!(110))])
    }

    pub fn bearish() -> Self {
        Self::new(vec![candle(dec!(110), dec!(100))])
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        *self.candles.lock().unwrap() = candles;
    }

    pub fn fail(&self) {
        self.fails.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CandleSource for MockCandles {
    async fn last_n_day_candles(&self, _symbol: &str, n: usize) -> ExchangeResult<Vec<Candle>> {
        if self.fails.load(Ordering::SeqCst) {
            return Err(ExchangeError::Transient("klines unavailable".into()));
        }
        let candles = self.candles.lock().unwrap();
        let skip = candles.len().saturating_sub(n);
        Ok(candles[skip..].to_vec())
    }
}
