//! Tradable token.

use serde::{Deserialize, Serialize};

/// A tradable base asset quoted in a stable currency.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Token {
    pub id: i64,

    /// Base asset (e.g. "BTC")
    pub name: String,

    /// Quote currency (e.g. "USDT")
    pub stable: String,

    pub is_active: bool,
}

impl Token {
    /// Exchange symbol, e.g. `BTCUSDT`.
    pub fn symbol(&self) -> String {
        format!("{}{}", self.name, self.stable).to_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol() {
        let token = Token {
            id: 1,
            name: "eth".to_string(),
            stable: "usdt".to_string(),
            is_active: true,
        };
        assert_eq!(token.symbol(), "ETHUSDT");
    }
}
