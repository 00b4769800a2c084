//! SQLite persistence for tokens, strategies, pooled orders and the user ledger.
//!
//! Every read/write the engine performs goes through [`Database`]:
//! - Tokens, strategies and targets (read-only for the engine)
//! - Orders and their per-user shares
//! - Atomic per-user settlement writes
//! - Append-only notifications, activities and operator alerts

mod fixture;

use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, QueryBuilder, Sqlite, SqlitePool};

use crate::models::{
    Activity, CloseReason, Notification, NotificationKind, OperatorAlert, Order, OrderSide,
    Strategy, Target, Token, User, UserBudget, UserOrder,
};

pub use fixture::{BudgetEntry, Fixture};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Order accepted by the exchange, ready to be persisted.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_id: String,
    pub token_id: i64,
    pub strategy_id: i64,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
}

/// One contributor's share of a [`NewOrder`].
#[derive(Debug, Clone)]
pub struct NewUserOrder {
    pub user_id: i64,
    pub contribution_percent: Decimal,
    pub commission_percent: Decimal,
    pub quantity: Decimal,
}

/// Amounts credited to one user when an order settles.
#[derive(Debug, Clone)]
pub struct SettlementWrite<'a> {
    pub user_order_id: i64,
    pub user_id: i64,
    pub order_id: &'a str,
    pub net_profit: Decimal,
    pub commission: Decimal,
    pub message: &'a str,
}

fn f(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = if database_url.contains(":memory:") {
            // one connection keeps a single in-memory database alive
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(database_url)
                .await
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await
        }
        .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                stable TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS strategies (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                direction TEXT NOT NULL,
                is_close_before_new_candle INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                root_id INTEGER REFERENCES strategies(id),
                CHECK (root_id IS NULL OR root_id <> id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS token_strategies (
                token_id INTEGER NOT NULL REFERENCES tokens(id),
                strategy_id INTEGER NOT NULL REFERENCES strategies(id),
                PRIMARY KEY (token_id, strategy_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS targets (
                id INTEGER PRIMARY KEY,
                strategy_id INTEGER NOT NULL REFERENCES strategies(id),
                token_id INTEGER NOT NULL REFERENCES tokens(id),
                sequence INTEGER NOT NULL,
                price REAL NOT NULL,
                stop_price REAL NOT NULL,
                UNIQUE (strategy_id, token_id, sequence)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                profit REAL NOT NULL DEFAULT 0,
                commission REAL NOT NULL DEFAULT 0,
                insurance REAL NOT NULL DEFAULT 0,
                available_balance REAL NOT NULL DEFAULT 0,
                trade_balance REAL NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS user_budgets (
                user_id INTEGER NOT NULL REFERENCES users(id),
                strategy_id INTEGER NOT NULL REFERENCES strategies(id),
                budget REAL NOT NULL,
                commission_percent REAL NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (user_id, strategy_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                token_id INTEGER NOT NULL REFERENCES tokens(id),
                strategy_id INTEGER NOT NULL REFERENCES strategies(id),
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                entry_price REAL NOT NULL,
                net_profit REAL NOT NULL DEFAULT 0,
                active_target INTEGER NOT NULL DEFAULT 0,
                stoploss_order_id TEXT,
                is_protected INTEGER NOT NULL DEFAULT 0,
                close_reason TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                closed_at TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS user_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                order_id TEXT NOT NULL REFERENCES orders(order_id),
                contribution_percent REAL NOT NULL,
                commission_percent REAL NOT NULL,
                quantity REAL NOT NULL,
                commission REAL NOT NULL DEFAULT 0,
                is_settled INTEGER NOT NULL DEFAULT 0,
                settled_at TEXT,
                UNIQUE (user_id, order_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                order_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount REAL NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS activities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                order_id TEXT NOT NULL,
                activity_type TEXT NOT NULL,
                value REAL NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS operator_alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_orders_token_status ON orders(token_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_orders_stoploss ON orders(stoploss_order_id)",
            "CREATE INDEX IF NOT EXISTS idx_user_orders_order ON user_orders(order_id)",
            "CREATE INDEX IF NOT EXISTS idx_strategies_root ON strategies(root_id)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    // ==================== Tokens ====================

    /// Save or update a token.
    pub async fn save_token(&self, token: &Token) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tokens (id, name, stable, is_active) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                stable = excluded.stable,
                is_active = excluded.is_active
            "#,
        )
        .bind(token.id)
        .bind(&token.name)
        .bind(&token.stable)
        .bind(token.is_active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn active_tokens(&self) -> Result<Vec<Token>> {
        sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE is_active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch active tokens")
    }

    pub async fn get_token(&self, token_id: i64) -> Result<Option<Token>> {
        sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE id = ?")
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch token")
    }

    /// Look up a token by exchange symbol (`name + stable`, case-insensitive).
    pub async fn token_by_symbol(&self, symbol: &str) -> Result<Option<Token>> {
        sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE UPPER(name || stable) = UPPER(?)")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch token by symbol")
    }

    // ==================== Strategies ====================

    /// Save or update a strategy.
    pub async fn save_strategy(&self, strategy: &Strategy) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO strategies (id, name, direction, is_close_before_new_candle, is_active, root_id)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                direction = excluded.direction,
                is_close_before_new_candle = excluded.is_close_before_new_candle,
                is_active = excluded.is_active,
                root_id = excluded.root_id
            "#,
        )
        .bind(strategy.id)
        .bind(&strategy.name)
        .bind(strategy.direction)
        .bind(strategy.is_close_before_new_candle)
        .bind(strategy.is_active)
        .bind(strategy.root_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn bind_token_strategy(&self, token_id: i64, strategy_id: i64) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO token_strategies (token_id, strategy_id) VALUES (?, ?)")
            .bind(token_id)
            .bind(strategy_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Active root strategies bound to the token that have at least two targets for it.
    pub async fn qualifying_root_strategies(&self, token_id: i64) -> Result<Vec<Strategy>> {
        sqlx::query_as::<_, Strategy>(
            r#"
            SELECT s.* FROM strategies s
            JOIN token_strategies ts ON ts.strategy_id = s.id
            WHERE ts.token_id = ?
              AND s.is_active = 1
              AND s.root_id IS NULL
              AND (SELECT COUNT(*) FROM targets t
                   WHERE t.strategy_id = s.id AND t.token_id = ts.token_id) >= 2
            ORDER BY s.id
            "#,
        )
        .bind(token_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch root strategies")
    }

    /// Ids of the strategies whose root is `root_id`.
    pub async fn child_strategy_ids(&self, root_id: i64) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM strategies WHERE root_id = ? ORDER BY id")
                .bind(root_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn get_strategy(&self, strategy_id: i64) -> Result<Option<Strategy>> {
        sqlx::query_as::<_, Strategy>("SELECT * FROM strategies WHERE id = ?")
            .bind(strategy_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch strategy")
    }

    // ==================== Targets ====================

    pub async fn save_target(&self, target: &Target) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO targets (id, strategy_id, token_id, sequence, price, stop_price)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                sequence = excluded.sequence,
                price = excluded.price,
                stop_price = excluded.stop_price
            "#,
        )
        .bind(target.id)
        .bind(target.strategy_id)
        .bind(target.token_id)
        .bind(target.sequence)
        .bind(f(target.price))
        .bind(f(target.stop_price))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Targets of a (strategy, token) pair in crossing order.
    pub async fn targets(&self, strategy_id: i64, token_id: i64) -> Result<Vec<Target>> {
        sqlx::query_as::<_, Target>(
            "SELECT * FROM targets WHERE strategy_id = ? AND token_id = ? ORDER BY sequence",
        )
        .bind(strategy_id)
        .bind(token_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch targets")
    }

    // ==================== Users & Budgets ====================

    pub async fn save_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, name, profit, commission, insurance, available_balance, trade_balance)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                available_balance = excluded.available_balance,
                trade_balance = excluded.trade_balance
            "#,
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(f(user.profit))
        .bind(f(user.commission))
        .bind(f(user.insurance))
        .bind(f(user.available_balance))
        .bind(f(user.trade_balance))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch users")
    }

    pub async fn save_budget(&self, budget: &BudgetEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_budgets (user_id, strategy_id, budget, commission_percent, is_active)
            VALUES (?, ?, ?, ?, 1)
            ON CONFLICT(user_id, strategy_id) DO UPDATE SET
                budget = excluded.budget,
                commission_percent = excluded.commission_percent,
                is_active = 1
            "#,
        )
        .bind(budget.user_id)
        .bind(budget.strategy_id)
        .bind(f(budget.budget))
        .bind(f(budget.commission_percent))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Active budget allocations for a strategy, with each user's current balance.
    pub async fn user_budgets(&self, strategy_id: i64) -> Result<Vec<UserBudget>> {
        sqlx::query_as::<_, UserBudget>(
            r#"
            SELECT b.user_id, b.strategy_id, b.budget, b.commission_percent, u.available_balance
            FROM user_budgets b
            JOIN users u ON u.id = b.user_id
            WHERE b.strategy_id = ? AND b.is_active = 1
            ORDER BY b.user_id
            "#,
        )
        .bind(strategy_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch user budgets")
    }

    // ==================== Orders ====================

    /// Persist an order together with its user shares in one transaction.
    pub async fn insert_order(&self, order: &NewOrder, shares: &[NewUserOrder]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO orders (order_id, token_id, strategy_id, status, side, quantity, entry_price)
            VALUES (?, ?, ?, 'ACTIVE', ?, ?, ?)
            "#,
        )
        .bind(&order.order_id)
        .bind(order.token_id)
        .bind(order.strategy_id)
        .bind(order.side)
        .bind(f(order.quantity))
        .bind(f(order.entry_price))
        .execute(&mut *tx)
        .await
        .context("Failed to insert order")?;

        for share in shares {
            sqlx::query(
                r#"
                INSERT INTO user_orders (user_id, order_id, contribution_percent, commission_percent, quantity)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(share.user_id)
            .bind(&order.order_id)
            .bind(f(share.contribution_percent))
            .bind(f(share.commission_percent))
            .bind(f(share.quantity))
            .execute(&mut *tx)
            .await
            .context("Failed to insert user order")?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Option<Order>> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch order")
    }

    /// The active order protected by the given stoploss id.
    pub async fn find_order_by_stoploss(&self, stoploss_order_id: &str) -> Result<Option<Order>> {
        sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE stoploss_order_id = ? AND status = 'ACTIVE'",
        )
        .bind(stoploss_order_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch order by stoploss")
    }

    pub async fn active_orders(&self) -> Result<Vec<Order>> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE status = 'ACTIVE' ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch active orders")
    }

    pub async fn active_orders_for_token(&self, token_id: i64) -> Result<Vec<Order>> {
        sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE token_id = ? AND status = 'ACTIVE' ORDER BY created_at",
        )
        .bind(token_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch active orders")
    }

    /// Active orders of a token opened under any of the given strategies.
    pub async fn active_orders_for_strategies(
        &self,
        token_id: i64,
        strategy_ids: &[i64],
    ) -> Result<Vec<Order>> {
        if strategy_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT * FROM orders WHERE status = 'ACTIVE' AND token_id = ",
        );
        builder.push_bind(token_id);
        builder.push(" AND strategy_id IN (");
        let mut ids = builder.separated(", ");
        for id in strategy_ids {
            ids.push_bind(*id);
        }
        ids.push_unseparated(") ORDER BY created_at");

        builder
            .build_query_as::<Order>()
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch strategy orders")
    }

    /// Record the live stoploss of an order (or its absence). Returns false
    /// if the order is no longer active.
    pub async fn set_protection(
        &self,
        order_id: &str,
        stoploss_order_id: Option<&str>,
        is_protected: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE orders SET stoploss_order_id = ?, is_protected = ? WHERE order_id = ? AND status = 'ACTIVE'",
        )
        .bind(stoploss_order_id)
        .bind(is_protected)
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Move the active target forward. Returns false if another caller already did.
    pub async fn advance_target(&self, order_id: &str, from: i64, to: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET active_target = ?, stoploss_order_id = NULL, is_protected = 0
            WHERE order_id = ? AND status = 'ACTIVE' AND active_target = ?
            "#,
        )
        .bind(to)
        .bind(order_id)
        .bind(from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Transition ACTIVE -> CLOSED and return the closed row, or `None` if
    /// the order was not active. The last recorded stoploss id is kept so the
    /// caller can withdraw a stop that was placed while the close ran.
    pub async fn mark_order_closed(
        &self,
        order_id: &str,
        net_profit: Decimal,
        reason: CloseReason,
    ) -> Result<Option<Order>> {
        sqlx::query_as::<_, Order>(
            r#"
            UPDATE orders SET
                status = 'CLOSED',
                net_profit = ?,
                close_reason = ?,
                is_protected = 0,
                closed_at = datetime('now')
            WHERE order_id = ? AND status = 'ACTIVE'
            RETURNING *
            "#,
        )
        .bind(f(net_profit))
        .bind(reason)
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to close order")
    }

    /// Closed orders with at least one share that was never settled.
    pub async fn unsettled_closed_orders(&self) -> Result<Vec<Order>> {
        sqlx::query_as::<_, Order>(
            r#"
            SELECT * FROM orders o
            WHERE o.status = 'CLOSED'
              AND EXISTS (SELECT 1 FROM user_orders u WHERE u.order_id = o.order_id AND u.is_settled = 0)
            ORDER BY o.closed_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch unsettled orders")
    }

    pub async fn user_orders(&self, order_id: &str) -> Result<Vec<UserOrder>> {
        sqlx::query_as::<_, UserOrder>("SELECT * FROM user_orders WHERE order_id = ? ORDER BY id")
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch user orders")
    }

    // ==================== Settlement ====================

    /// Apply one user's settlement atomically.
    ///
    /// Marks the user order settled, updates the user's five balance fields in a
    /// single statement and appends the notification and activity. Returns the
    /// updated user, or `None` if this share was already settled.
    pub async fn settle_user_order(&self, entry: &SettlementWrite<'_>) -> Result<Option<User>> {
        let mut tx = self.pool.begin().await?;

        let marked = sqlx::query(
            r#"
            UPDATE user_orders SET commission = ?, is_settled = 1, settled_at = datetime('now')
            WHERE id = ? AND is_settled = 0
            "#,
        )
        .bind(f(entry.commission))
        .bind(entry.user_order_id)
        .execute(&mut *tx)
        .await?;

        if marked.rows_affected() == 0 {
            return Ok(None);
        }

        let net = f(entry.net_profit);
        let commission = f(entry.commission);

        // a loss larger than the available balance empties it and the
        // shortfall comes out of the trade balance
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET
                profit = profit + ?,
                commission = commission + ?,
                insurance = insurance + ?,
                trade_balance = CASE
                    WHEN ? < 0 AND available_balance + ? < 0 THEN trade_balance + available_balance + ?
                    ELSE trade_balance
                END,
                available_balance = CASE
                    WHEN ? < 0 AND available_balance + ? < 0 THEN 0
                    ELSE available_balance + ?
                END
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(net)
        .bind(commission)
        .bind(commission)
        .bind(net)
        .bind(net)
        .bind(net)
        .bind(net)
        .bind(net)
        .bind(net)
        .bind(entry.user_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to update user balances")?;

        sqlx::query(
            "INSERT INTO notifications (user_id, order_id, kind, amount, message) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.user_id)
        .bind(entry.order_id)
        .bind(NotificationKind::for_amount(entry.net_profit))
        .bind(net)
        .bind(entry.message)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO activities (user_id, order_id, activity_type, value) VALUES (?, ?, 'TRADE_SETTLEMENT', ?)",
        )
        .bind(entry.user_id)
        .bind(entry.order_id)
        .bind(net)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(user))
    }

    pub async fn notifications_for_order(&self, order_id: &str) -> Result<Vec<Notification>> {
        sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE order_id = ? ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch notifications")
    }

    pub async fn activities_for_user(&self, user_id: i64) -> Result<Vec<Activity>> {
        sqlx::query_as::<_, Activity>("SELECT * FROM activities WHERE user_id = ? ORDER BY id")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch activities")
    }

    // ==================== Operator Alerts ====================

    pub async fn record_alert(&self, order_id: &str, message: &str) -> Result<()> {
        sqlx::query("INSERT INTO operator_alerts (order_id, message) VALUES (?, ?)")
            .bind(order_id)
            .bind(message)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn alerts(&self, limit: i64) -> Result<Vec<OperatorAlert>> {
        sqlx::query_as::<_, OperatorAlert>(
            "SELECT * FROM operator_alerts ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch alerts")
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
