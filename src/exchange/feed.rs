//! Polling event source.
//!
//! Stands in for a push stream: every tick it reads the last price of each
//! token with active orders and the status of every live stoploss, and emits
//! the results as [`MarketEvent`]s. Delivery is at-least-once; consumers are
//! expected to tolerate repeats.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::db::Database;

use super::{Exchange, MarketEvent};

pub struct PollingFeed {
    db: Arc<Database>,
    exchange: Arc<dyn Exchange>,
    poll_interval: Duration,
}

impl PollingFeed {
    pub fn new(db: Arc<Database>, exchange: Arc<dyn Exchange>, poll_interval: Duration) -> Self {
        Self {
            db,
            exchange,
            poll_interval,
        }
    }

    /// Poll until shutdown is signalled or the receiver goes away.
    pub async fn run(self, tx: mpsc::Sender<MarketEvent>, shutdown: Arc<AtomicBool>) {
        info!(interval_secs = self.poll_interval.as_secs(), "Market feed started");
        let mut ticker = interval(self.poll_interval);

        while !shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;

            match self.poll_once(&tx).await {
                Ok(sent) => debug!(events = sent, "Feed poll complete"),
                Err(e) if tx.is_closed() => {
                    debug!(error = %e, "Event receiver dropped");
                    break;
                }
                Err(e) => warn!(error = %e, "Feed poll failed"),
            }
        }

        info!("Market feed stopped");
    }

    /// One polling round. Returns the number of events sent.
    pub async fn poll_once(&self, tx: &mpsc::Sender<MarketEvent>) -> Result<usize> {
        let orders = self.db.active_orders().await?;
        if orders.is_empty() {
            return Ok(0);
        }

        let mut symbols: HashMap<i64, String> = HashMap::new();
        for order in &orders {
            if symbols.contains_key(&order.token_id) {
                continue;
            }
            if let Some(token) = self.db.get_token(order.token_id).await? {
                symbols.insert(order.token_id, token.symbol());
            }
        }

        let mut sent = 0;

        // stop fills first so a filled order is closed before its targets are re-checked
        for order in &orders {
            let (Some(stop_id), Some(symbol)) =
                (order.stoploss_order_id.as_deref(), symbols.get(&order.token_id))
            else {
                continue;
            };

            match self.exchange.order_status(symbol, stop_id).await {
                Ok(update) if update.status.is_final() => {
                    tx.send(MarketEvent::Order(update)).await?;
                    sent += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(order_id = %order.order_id, stop_id = %stop_id, error = %e, "Stop status unavailable"),
            }
        }

        for symbol in symbols.values() {
            match self.exchange.last_price(symbol).await {
                Ok(price) => {
                    tx.send(MarketEvent::Price {
                        symbol: symbol.clone(),
                        price,
                    })
                    .await?;
                    sent += 1;
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "Price unavailable"),
            }
        }

        Ok(sent)
    }
}
