//! Strategy & order execution engine.
//!
//! Control flows:
//! - daily: [`StrategyEvaluator`] -> [`OrderManager`] (open / close) -> `SettlementLedger`
//! - real time: price ticks -> [`TargetMonitor`] -> [`OrderManager`] (advance / close),
//!   stop fills -> [`OrderManager::handle_order_update`]
//!
//! Both flows coordinate only through the [`DedupGuards`].

mod dedup;
mod evaluator;
mod ledger;
mod lifecycle;
mod monitor;
mod retry;
mod sizing;

pub use dedup::DedupGuards;
pub use evaluator::StrategyEvaluator;
pub use lifecycle::{CloseOutcome, OrderManager};
pub use monitor::TargetMonitor;
