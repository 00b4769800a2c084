//! Pooled Futures Trading Engine
//!
//! Evaluates strategies daily, opens pooled orders on behalf of many users,
//! walks them through their price targets with a protective stoploss and
//! settles the result across every participant.

mod bot;
mod config;
mod db;
mod engine;
mod error;
mod exchange;
mod models;

#[cfg(test)]
mod testkit;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::bot::Bot;
use crate::config::EngineConfig;
use crate::db::{Database, Fixture};
use crate::engine::CloseOutcome;
use crate::exchange::{CandleSource, Exchange, PaperExchange, RestExchange};
use crate::models::CloseReason;

/// Pooled futures trading engine CLI.
#[derive(Parser)]
#[command(name = "pool-trader")]
#[command(about = "Run pooled multi-user strategies on a futures exchange", long_about = None)]
struct Cli {
    /// Database connection string (defaults to DATABASE_URL or ./pool_trader.db)
    #[arg(short, long, env = "DATABASE_URL")]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine: market feed, target monitor and daily evaluation
    Run {
        /// Simulate fills instead of trading
        #[arg(long)]
        dry_run: bool,

        /// Run the daily evaluation immediately instead of at the next UTC day
        #[arg(long)]
        evaluate_now: bool,
    },

    /// Run the daily evaluation once
    Evaluate {
        /// Only evaluate this token
        #[arg(short, long)]
        token: Option<i64>,

        /// Simulate fills instead of trading
        #[arg(long)]
        dry_run: bool,
    },

    /// Close an active order at market and settle it
    Close {
        /// Exchange order id
        order_id: String,

        /// Simulate fills instead of trading
        #[arg(long)]
        dry_run: bool,
    },

    /// Finish settlement of closed orders with unsettled users
    Settle {
        /// Only this order (defaults to every pending order)
        order_id: Option<String>,
    },

    /// Show active orders and recent operator alerts
    Status,

    /// Show user balances
    Balances,

    /// Load tokens, strategies, targets, users and budgets from a JSON file
    Import {
        /// Fixture file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = EngineConfig::from_env()?;
    if let Some(database) = cli.database {
        config.database_url = database;
    }

    // Initialize database
    let db = Arc::new(Database::new(&config.database_url).await?);

    match cli.command {
        Commands::Run {
            dry_run,
            evaluate_now,
        } => {
            config.dry_run |= dry_run;
            let (exchange, candles) = build_exchange(&mut config)?;

            info!(
                dry_run = config.dry_run,
                leverage = config.leverage,
                evaluate_now = evaluate_now,
                "Starting pooled trading engine"
            );

            let tokens = db.active_tokens().await?;
            if tokens.is_empty() {
                println!("No active tokens. Use 'pool-trader import <file>' first.");
                return Ok(());
            }

            let mut bot = Bot::new(config.clone(), db.clone(), exchange, candles);

            println!("\n=== Pooled Trading Engine ===");
            println!("Active tokens:    {}", tokens.len());
            println!("Leverage:         {}x", config.leverage);
            println!("Polling interval: {}s", config.poll_interval_secs);
            println!("Mode: {}", if config.dry_run { "DRY RUN (paper fills)" } else { "LIVE TRADING" });
            println!("\nPress Ctrl+C to stop.\n");

            // Run the bot
            if let Err(e) = bot.run(evaluate_now).await {
                tracing::error!(error = %e, "Bot error");
            }

            // Show final stats
            let stats = bot.get_stats().await;
            println!("\n{}", stats);
        }

        Commands::Evaluate { token, dry_run } => {
            config.dry_run |= dry_run;
            let (exchange, candles) = build_exchange(&mut config)?;
            let bot = Bot::new(config, db.clone(), exchange, candles);
            let evaluator = bot.evaluator();

            match token {
                Some(token_id) => {
                    let report = evaluator.evaluate_token_id(token_id).await?;
                    println!("\n=== Token {} ===", token_id);
                    println!("Strategies: {}", report.strategies);
                    println!("Opened:     {}", report.opened);
                    println!("Closed:     {}", report.closed);
                    println!("Skipped:    {}", report.skipped);
                }
                None => {
                    let report = evaluator.run_daily().await?;
                    println!("\n{}", report);
                }
            }
        }

        Commands::Close { order_id, dry_run } => {
            config.dry_run |= dry_run;
            let (exchange, candles) = build_exchange(&mut config)?;
            let bot = Bot::new(config, db.clone(), exchange, candles);

            match bot.manager().close(&order_id, CloseReason::Manual).await? {
                CloseOutcome::Closed {
                    net_profit,
                    settlement,
                } => {
                    println!("Closed {} with net result {:.2}", order_id, net_profit);
                    for result in &settlement.results {
                        println!(
                            "  user {:<6} {:>12.2}  commission {:>10.2}  {:?}",
                            result.settlement.user_id,
                            result.settlement.net_profit,
                            result.settlement.commission,
                            result.status
                        );
                    }
                }
                CloseOutcome::AlreadyClosing => println!("Order {} is already being closed.", order_id),
                CloseOutcome::NotActive => println!("Order {} is not active.", order_id),
            }
        }

        Commands::Settle { order_id } => {
            let (exchange, candles) = build_exchange(&mut config)?;
            let bot = Bot::new(config, db.clone(), exchange, candles);
            let manager = bot.manager();

            let reports = match order_id {
                Some(order_id) => match manager.settle_closed(&order_id).await? {
                    Some(report) => vec![report],
                    None => {
                        println!("Order {} is not closed or is being closed.", order_id);
                        return Ok(());
                    }
                },
                None => manager.settle_pending().await?,
            };

            if reports.is_empty() {
                println!("No pending settlements.");
            }
            for report in &reports {
                println!(
                    "{:<24} applied {:>3}  failed {:>3}",
                    truncate(&report.order_id, 24),
                    report.applied(),
                    report.failed()
                );
            }
        }

        Commands::Status => {
            let orders = db.active_orders().await?;

            println!("\n=== Active Orders ({}) ===", orders.len());
            if !orders.is_empty() {
                println!(
                    "{:<24} {:<10} {:<5} {:>12} {:>12} {:>7} {:>10}",
                    "ORDER", "SYMBOL", "SIDE", "QTY", "ENTRY", "TARGET", "PROTECTED"
                );
                println!("{}", "-".repeat(86));
            }
            for order in &orders {
                let symbol = db
                    .get_token(order.token_id)
                    .await?
                    .map(|t| t.symbol())
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    "{:<24} {:<10} {:<5} {:>12} {:>12.4} {:>7} {:>10}",
                    truncate(&order.order_id, 24),
                    symbol,
                    order.side,
                    order.quantity,
                    order.entry_price,
                    order.active_target,
                    if order.is_protected { "yes" } else { "NO" }
                );
            }

            let alerts = db.alerts(10).await?;
            if !alerts.is_empty() {
                println!("\n=== Recent Operator Alerts ===");
                for alert in &alerts {
                    println!("  [{}] {} {}", alert.created_at, alert.order_id, alert.message);
                }
            }
        }

        Commands::Balances => {
            let users = db.list_users().await?;

            if users.is_empty() {
                println!("No users. Use 'pool-trader import <file>' to add some.");
                return Ok(());
            }

            println!(
                "\n{:<6} {:<16} {:>12} {:>12} {:>12} {:>12} {:>12}",
                "ID", "NAME", "AVAILABLE", "TRADE", "PROFIT", "COMMISSION", "INSURANCE"
            );
            println!("{}", "-".repeat(88));

            for user in users {
                println!(
                    "{:<6} {:<16} {:>12.2} {:>12.2} {:>12.2} {:>12.2} {:>12.2}",
                    user.id,
                    truncate(&user.name, 16),
                    user.available_balance,
                    user.trade_balance,
                    user.profit,
                    user.commission,
                    user.insurance
                );
            }
        }

        Commands::Import { file } => {
            let fixture = Fixture::from_file(&file)?;
            db.import(&fixture).await?;
            println!("Imported {}", file.display());
        }
    }

    Ok(())
}

/// Pick the exchange implementation. Without credentials the engine falls
/// back to paper trading against live public market data.
fn build_exchange(config: &mut EngineConfig) -> Result<(Arc<dyn Exchange>, Arc<dyn CandleSource>)> {
    if !config.dry_run && !config.has_credentials() {
        warn!("Exchange credentials not configured. Running in dry-run mode.");
        config.dry_run = true;
    }

    if config.dry_run {
        let market = RestExchange::public(&config.exchange_base_url)?;
        let candles = RestExchange::public(&config.exchange_base_url)?;
        let exchange: Arc<dyn Exchange> = Arc::new(PaperExchange::new(market));
        let candles: Arc<dyn CandleSource> = Arc::new(candles);
        return Ok((exchange, candles));
    }

    let live = Arc::new(
        RestExchange::from_config(config).context("Failed to create exchange client")?,
    );
    let exchange: Arc<dyn Exchange> = live.clone();
    let candles: Arc<dyn CandleSource> = live;
    Ok((exchange, candles))
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
