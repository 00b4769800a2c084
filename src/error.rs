//! Exchange error taxonomy.
//!
//! Every exchange call returns [`ExchangeError`], which the engine classifies
//! as either transient (worth retrying) or a rejection (never retried).

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    /// Timeout, rate limit, 5xx or connection failure.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// The exchange refused the request (bad price, insufficient margin, ...).
    #[error("exchange rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },

    /// The response could not be understood.
    #[error("failed to decode exchange response: {0}")]
    Decode(String),
}

impl ExchangeError {
    pub fn rejected(code: i64, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            // timeouts, connect errors and body errors are all worth another attempt
            Self::Transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;
