//! Paper trading exchange for dry runs.
//!
//! Orders fill instantly at the last observed price. Positions are netted per
//! symbol so closing fills produce a realized PnL, and stop orders trigger the
//! first time `order_status` sees the price cross them.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ExchangeError, ExchangeResult};
use crate::models::OrderSide;

use super::{
    ConditionalKind, Exchange, FillStatus, OrderUpdate, PlacedOrder, RestExchange, SymbolRules,
};

/// Net position of a symbol. Positive quantity is long.
#[derive(Debug, Clone, Default)]
struct PaperPosition {
    quantity: Decimal,
    avg_price: Decimal,
}

impl PaperPosition {
    /// Apply a fill and return the PnL it realizes.
    fn apply(&mut self, side: OrderSide, quantity: Decimal, price: Decimal) -> Decimal {
        let delta = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };

        let same_direction = self.quantity.is_zero()
            || (self.quantity > Decimal::ZERO) == (delta > Decimal::ZERO);

        if same_direction {
            let total = self.quantity + delta;
            self.avg_price = (self.avg_price * self.quantity.abs() + price * delta.abs()) / total.abs();
            self.quantity = total;
            return Decimal::ZERO;
        }

        let reduced = delta.abs().min(self.quantity.abs());
        let realized = if self.quantity > Decimal::ZERO {
            (price - self.avg_price) * reduced
        } else {
            (self.avg_price - price) * reduced
        };

        let total = self.quantity + delta;
        if total.is_zero() {
            self.avg_price = Decimal::ZERO;
        } else if (total > Decimal::ZERO) != (self.quantity > Decimal::ZERO) {
            // flipped through zero: the remainder opens at the fill price
            self.avg_price = price;
        }
        self.quantity = total;

        realized
    }
}

#[derive(Debug, Clone)]
struct PaperStop {
    symbol: String,
    side: OrderSide,
    kind: ConditionalKind,
    quantity: Decimal,
    stop_price: Decimal,
    status: FillStatus,
    fill_price: Option<Decimal>,
}

impl PaperStop {
    fn triggers_at(&self, price: Decimal) -> bool {
        match (self.kind, self.side) {
            (ConditionalKind::Market, _) => true,
            // a sell stop protects a long: fires on the way down
            (ConditionalKind::Stop, OrderSide::Sell) => price <= self.stop_price,
            (ConditionalKind::Stop, OrderSide::Buy) => price >= self.stop_price,
            (ConditionalKind::TakeProfit, OrderSide::Sell) => price >= self.stop_price,
            (ConditionalKind::TakeProfit, OrderSide::Buy) => price <= self.stop_price,
        }
    }
}

#[derive(Debug, Default)]
struct PaperState {
    next_id: u64,
    positions: HashMap<String, PaperPosition>,
    stops: HashMap<String, PaperStop>,
    prices: HashMap<String, Decimal>,
    leverage: HashMap<String, u32>,
}

impl PaperState {
    fn next_order_id(&mut self) -> String {
        self.next_id += 1;
        format!("paper-{}", self.next_id)
    }

    fn fill(&mut self, symbol: &str, side: OrderSide, quantity: Decimal, price: Decimal) -> Decimal {
        self.positions
            .entry(symbol.to_string())
            .or_default()
            .apply(side, quantity, price)
    }
}

/// Simulated exchange. Prices come from a public market-data client when one
/// is attached, otherwise from [`PaperExchange::set_price`].
pub struct PaperExchange {
    market: Option<RestExchange>,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(market: RestExchange) -> Self {
        Self {
            market: Some(market),
            state: Mutex::new(PaperState::default()),
        }
    }

    /// Exchange without market data; prices must be set manually.
    #[cfg(test)]
    pub fn offline() -> Self {
        Self {
            market: None,
            state: Mutex::new(PaperState::default()),
        }
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state
            .lock()
            .await
            .prices
            .insert(symbol.to_string(), price);
    }

    async fn price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        if let Some(market) = &self.market {
            let price = market.last_price(symbol).await?;
            self.set_price(symbol, price).await;
            return Ok(price);
        }

        self.state
            .lock()
            .await
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::rejected(-1121, format!("No price for {}", symbol)))
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.state
            .lock()
            .await
            .leverage
            .insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> ExchangeResult<PlacedOrder> {
        let price = self.price(symbol).await?;

        let mut state = self.state.lock().await;
        state.fill(symbol, side, quantity, price);
        let order_id = state.next_order_id();

        info!(
            order_id = %order_id,
            symbol = %symbol,
            side = %side,
            quantity = %quantity,
            price = %price,
            "[PAPER] Market order filled"
        );

        Ok(PlacedOrder {
            order_id,
            avg_price: price,
        })
    }

    async fn place_conditional_order(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: ConditionalKind,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> ExchangeResult<String> {
        let price = self.price(symbol).await?;

        let stop = PaperStop {
            symbol: symbol.to_string(),
            side,
            kind,
            quantity,
            stop_price,
            status: FillStatus::New,
            fill_price: None,
        };

        if kind != ConditionalKind::Market && stop.triggers_at(price) {
            return Err(ExchangeError::rejected(-2021, "Order would immediately trigger."));
        }

        let mut state = self.state.lock().await;
        let order_id = state.next_order_id();
        state.stops.insert(order_id.clone(), stop);

        debug!(
            order_id = %order_id,
            symbol = %symbol,
            kind = kind.as_str(),
            stop_price = %stop_price,
            "[PAPER] Conditional order placed"
        );

        Ok(order_id)
    }

    async fn cancel_orders(&self, _symbol: &str, order_ids: &[String]) -> ExchangeResult<()> {
        let mut state = self.state.lock().await;
        for order_id in order_ids {
            if let Some(stop) = state.stops.get_mut(order_id) {
                if !stop.status.is_final() {
                    stop.status = FillStatus::Canceled;
                }
            }
        }
        Ok(())
    }

    async fn close_market(
        &self,
        symbol: &str,
        position_side: OrderSide,
        quantity: Decimal,
    ) -> ExchangeResult<Decimal> {
        let price = self.price(symbol).await?;

        let mut state = self.state.lock().await;
        let realized = state.fill(symbol, position_side.opposite(), quantity, price);

        info!(
            symbol = %symbol,
            quantity = %quantity,
            price = %price,
            realized = %realized,
            "[PAPER] Position closed"
        );

        Ok(realized)
    }

    async fn last_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        self.price(symbol).await
    }

    async fn symbol_rules(&self, symbol: &str) -> ExchangeResult<SymbolRules> {
        match &self.market {
            Some(market) => market.symbol_rules(symbol).await,
            None => Ok(SymbolRules {
                min_qty: dec!(0.001),
                step_size: dec!(0.001),
                min_notional: dec!(5),
            }),
        }
    }

    async fn order_status(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderUpdate> {
        let price = self.price(symbol).await?;

        let mut state = self.state.lock().await;
        let Some(mut stop) = state.stops.get(order_id).cloned() else {
            return Err(ExchangeError::rejected(-2013, "Order does not exist."));
        };

        if stop.status == FillStatus::New && stop.triggers_at(price) {
            state.fill(&stop.symbol, stop.side, stop.quantity, price);
            stop.status = FillStatus::Filled;
            stop.fill_price = Some(price);
            state.stops.insert(order_id.to_string(), stop.clone());

            info!(order_id = %order_id, price = %price, "[PAPER] Stop triggered");
        }

        Ok(OrderUpdate {
            order_id: order_id.to_string(),
            status: stop.status,
            avg_price: stop.fill_price,
        })
    }
}
