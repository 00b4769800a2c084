//! Bot runner: wires the engine to the market feed and the daily schedule.
//!
//! Handles:
//! - Dispatching price ticks to the target monitor
//! - Dispatching stop fills/cancels to the order manager
//! - Triggering the daily evaluation on UTC day rollover
//! - Graceful shutdown on Ctrl+C

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::db::Database;
use crate::engine::{CloseOutcome, DedupGuards, OrderManager, StrategyEvaluator, TargetMonitor};
use crate::exchange::{CandleSource, Exchange, MarketEvent, PollingFeed};

const EVENT_BUFFER: usize = 1024;
const SCHEDULE_CHECK: Duration = Duration::from_secs(1);

/// Counters updated by event handlers.
#[derive(Debug, Default)]
struct Counters {
    price_ticks: AtomicU64,
    order_updates: AtomicU64,
    targets_crossed: AtomicU64,
    stop_closes: AtomicU64,
    daily_runs: AtomicU64,
    handler_errors: AtomicU64,
}

/// Main bot runner.
pub struct Bot {
    config: EngineConfig,
    db: Arc<Database>,
    exchange: Arc<dyn Exchange>,
    manager: Arc<OrderManager>,
    monitor: Arc<TargetMonitor>,
    evaluator: Arc<StrategyEvaluator>,
    counters: Arc<Counters>,

    /// UTC day of the last daily evaluation
    last_evaluated: Option<NaiveDate>,
    evaluation: Option<JoinHandle<()>>,
    /// In-flight event handlers, drained on shutdown
    handlers: JoinSet<()>,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    pub fn new(
        config: EngineConfig,
        db: Arc<Database>,
        exchange: Arc<dyn Exchange>,
        candles: Arc<dyn CandleSource>,
    ) -> Self {
        let guards = DedupGuards::new();
        let manager = Arc::new(OrderManager::new(db.clone(), exchange.clone(), guards, &config));
        let monitor = Arc::new(TargetMonitor::new(db.clone(), manager.clone()));
        let evaluator = Arc::new(StrategyEvaluator::new(
            db.clone(),
            exchange.clone(),
            candles,
            manager.clone(),
            config.leverage,
            config.max_concurrent_tokens,
        ));

        Self {
            config,
            db,
            exchange,
            manager,
            monitor,
            evaluator,
            counters: Arc::new(Counters::default()),
            last_evaluated: None,
            evaluation: None,
            handlers: JoinSet::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn manager(&self) -> Arc<OrderManager> {
        self.manager.clone()
    }

    pub fn evaluator(&self) -> Arc<StrategyEvaluator> {
        self.evaluator.clone()
    }

    /// Main run loop. Without `evaluate_now` the first daily evaluation waits
    /// for the next UTC day.
    pub async fn run(&mut self, evaluate_now: bool) -> Result<()> {
        info!(
            dry_run = self.config.dry_run,
            poll_interval = self.config.poll_interval_secs,
            leverage = self.config.leverage,
            "Starting bot run loop"
        );

        if !evaluate_now {
            self.last_evaluated = Some(Utc::now().date_naive());
        }

        // closes interrupted by an earlier run still owe their users a settlement
        match self.manager.settle_pending().await {
            Ok(reports) if !reports.is_empty() => {
                info!(orders = reports.len(), "Resumed pending settlements");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to resume pending settlements"),
        }

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let feed = PollingFeed::new(
            self.db.clone(),
            self.exchange.clone(),
            Duration::from_secs(self.config.poll_interval_secs),
        );
        let feed_handle = tokio::spawn(feed.run(tx, self.shutdown.clone()));

        let mut schedule = interval(SCHEDULE_CHECK);

        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                Some(event) = rx.recv() => self.dispatch(event),
                _ = schedule.tick() => self.check_schedule(Utc::now().date_naive()),
            }
        }

        // Graceful shutdown
        drop(rx);
        if let Err(e) = feed_handle.await {
            warn!(error = %e, "Feed task ended abnormally");
        }
        self.shutdown().await;

        Ok(())
    }

    /// Start the daily evaluation if the day rolled over and none is running.
    fn check_schedule(&mut self, today: NaiveDate) {
        if !is_due(self.last_evaluated, today) {
            return;
        }
        if self.evaluation.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Daily evaluation still running");
            return;
        }

        self.last_evaluated = Some(today);
        self.counters.daily_runs.fetch_add(1, Ordering::Relaxed);

        let evaluator = self.evaluator.clone();
        self.evaluation = Some(tokio::spawn(async move {
            match evaluator.run_daily().await {
                Ok(report) => info!(
                    evaluated = report.evaluated,
                    opened = report.opened,
                    closed = report.closed,
                    failed = report.failed.len(),
                    "Daily batch finished"
                ),
                Err(e) => error!(error = %e, "Daily batch failed"),
            }
        }));
    }

    /// Handle an event on its own task so slow exchange calls don't block the feed.
    fn dispatch(&mut self, event: MarketEvent) {
        while let Some(finished) = self.handlers.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "Event handler task failed");
            }
        }

        let monitor = self.monitor.clone();
        let manager = self.manager.clone();
        let counters = self.counters.clone();

        self.handlers.spawn(async move {
            if let Err(e) = handle_event(&monitor, &manager, &counters, event).await {
                counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Event handling failed");
            }
        });
    }

    /// Graceful shutdown.
    async fn shutdown(&mut self) {
        info!("Shutting down bot...");

        // in-flight opens and closes are never cancelled
        if !self.handlers.is_empty() {
            info!(handlers = self.handlers.len(), "Waiting for event handlers to finish");
        }
        while let Some(finished) = self.handlers.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "Event handler task failed");
            }
        }

        if let Some(handle) = self.evaluation.take() {
            if !handle.is_finished() {
                info!("Waiting for daily evaluation to finish");
            }
            if let Err(e) = handle.await {
                error!(error = %e, "Daily evaluation task failed");
            }
        }

        info!("Bot shutdown complete");
    }

    /// Get current stats.
    pub async fn get_stats(&self) -> BotStats {
        let orders = self.db.active_orders().await.unwrap_or_default();
        let active_orders = orders.len();
        let unprotected_orders = orders.iter().filter(|o| !o.is_protected).count();

        BotStats {
            price_ticks: self.counters.price_ticks.load(Ordering::Relaxed),
            order_updates: self.counters.order_updates.load(Ordering::Relaxed),
            targets_crossed: self.counters.targets_crossed.load(Ordering::Relaxed),
            stop_closes: self.counters.stop_closes.load(Ordering::Relaxed),
            daily_runs: self.counters.daily_runs.load(Ordering::Relaxed),
            handler_errors: self.counters.handler_errors.load(Ordering::Relaxed),
            active_orders,
            unprotected_orders,
            is_running: !self.shutdown.load(Ordering::SeqCst),
            dry_run: self.config.dry_run,
        }
    }
}

fn is_due(last_evaluated: Option<NaiveDate>, today: NaiveDate) -> bool {
    last_evaluated.map_or(true, |last| last < today)
}

async fn handle_event(
    monitor: &TargetMonitor,
    manager: &OrderManager,
    counters: &Counters,
    event: MarketEvent,
) -> Result<()> {
    match event {
        MarketEvent::Price { symbol, price } => {
            counters.price_ticks.fetch_add(1, Ordering::Relaxed);
            let crossed = monitor.on_symbol_price(&symbol, price).await?;
            counters
                .targets_crossed
                .fetch_add(crossed.len() as u64, Ordering::Relaxed);
        }
        MarketEvent::Order(update) => {
            counters.order_updates.fetch_add(1, Ordering::Relaxed);
            if let Some(CloseOutcome::Closed { net_profit, .. }) = manager.handle_order_update(&update).await? {
                counters.stop_closes.fetch_add(1, Ordering::Relaxed);
                info!(stoploss_order_id = %update.order_id, net_profit = %net_profit, "Order closed by stoploss");
            }
        }
    }
    Ok(())
}

/// Bot statistics.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub price_ticks: u64,
    pub order_updates: u64,
    pub targets_crossed: u64,
    pub stop_closes: u64,
    pub daily_runs: u64,
    pub handler_errors: u64,
    pub active_orders: usize,
    pub unprotected_orders: usize,
    pub is_running: bool,
    pub dry_run: bool,
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bot Statistics ===")?;
        writeln!(f, "Price Ticks:      {}", self.price_ticks)?;
        writeln!(f, "Order Updates:    {}", self.order_updates)?;
        writeln!(f, "Targets Crossed:  {}", self.targets_crossed)?;
        writeln!(f, "Stoploss Closes:  {}", self.stop_closes)?;
        writeln!(f, "Daily Runs:       {}", self.daily_runs)?;
        writeln!(f, "Handler Errors:   {}", self.handler_errors)?;
        writeln!(f, "Active Orders:    {} ({} unprotected)", self.active_orders, self.unprotected_orders)?;
        writeln!(f, "Status:           {} {}",
            if self.is_running { "Running" } else { "Stopped" },
            if self.dry_run { "(Dry Run)" } else { "" })?;
        Ok(())
    }
}
