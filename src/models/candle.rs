//! Daily OHLCV candle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,

    /// Candle open time
    pub date: DateTime<Utc>,
}

impl Candle {
    /// Green (or flat) candle.
    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }
}
