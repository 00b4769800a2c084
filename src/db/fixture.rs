//! JSON import of reference data (tokens, strategies, targets, users, budgets).
//!
//! Administration of these records lives outside the engine; the import is
//! how a dry-run database gets populated.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::info;

use crate::models::{Strategy, Target, Token, User};

use super::Database;

/// A user's allocation to a strategy.
#[derive(Debug, Clone, Deserialize)]
pub struct BudgetEntry {
    pub user_id: i64,
    pub strategy_id: i64,
    pub budget: Decimal,
    #[serde(default)]
    pub commission_percent: Decimal,
}

/// Reference data file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub tokens: Vec<Token>,
    pub strategies: Vec<Strategy>,
    /// (token_id, strategy_id) bindings
    pub token_strategies: Vec<(i64, i64)>,
    pub targets: Vec<Target>,
    pub users: Vec<User>,
    pub budgets: Vec<BudgetEntry>,
}

impl Fixture {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let fixture: Fixture = serde_json::from_str(&raw).context("Failed to parse fixture")?;
        fixture.validate()?;
        Ok(fixture)
    }

    /// Reject hierarchies deeper than one level.
    fn validate(&self) -> Result<()> {
        for strategy in &self.strategies {
            let Some(root_id) = strategy.root_id else {
                continue;
            };
            let Some(root) = self.strategies.iter().find(|s| s.id == root_id) else {
                continue;
            };
            if !root.is_root() {
                bail!(
                    "strategy {} references {} which is itself a child strategy",
                    strategy.id,
                    root_id
                );
            }
        }
        Ok(())
    }
}

impl Database {
    /// Upsert every record of a fixture, parents first.
    pub async fn import(&self, fixture: &Fixture) -> Result<()> {
        for token in &fixture.tokens {
            self.save_token(token).await?;
        }

        // roots before children so the self-reference resolves
        let (roots, children): (Vec<&Strategy>, Vec<&Strategy>) =
            fixture.strategies.iter().partition(|s| s.is_root());
        for strategy in roots.into_iter().chain(children) {
            self.save_strategy(strategy).await?;
        }

        for (token_id, strategy_id) in &fixture.token_strategies {
            self.bind_token_strategy(*token_id, *strategy_id).await?;
        }
        for target in &fixture.targets {
            self.save_target(target).await?;
        }
        for user in &fixture.users {
            self.save_user(user).await?;
        }
        for budget in &fixture.budgets {
            self.save_budget(budget).await?;
        }

        info!(
            tokens = fixture.tokens.len(),
            strategies = fixture.strategies.len(),
            targets = fixture.targets.len(),
            users = fixture.users.len(),
            budgets = fixture.budgets.len(),
            "Fixture imported"
        );

        Ok(())
    }
}
