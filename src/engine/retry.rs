//! Bounded constant backoff for the `backoff` crate.

use std::time::Duration;

use backoff::backoff::Backoff;

use crate::error::ExchangeError;

/// Waits `delay` between attempts and gives up after `max_attempts` in total.
#[derive(Debug, Clone)]
pub struct FixedRetry {
    delay: Duration,
    max_attempts: u32,
    retries_left: u32,
}

impl FixedRetry {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        let max_attempts = max_attempts.max(1);
        Self {
            delay,
            max_attempts,
            retries_left: max_attempts - 1,
        }
    }
}

impl Backoff for FixedRetry {
    fn reset(&mut self) {
        self.retries_left = self.max_attempts - 1;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;
        Some(self.delay)
    }
}

/// Transient exchange errors are retried, everything else stops the loop.
pub fn classify(err: ExchangeError) -> backoff::Error<ExchangeError> {
    if err.is_transient() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_bounded_attempts() {
        let mut retry = FixedRetry::new(Duration::from_millis(5), 3);
        assert_eq!(retry.next_backoff(), Some(Duration::from_millis(5)));
        assert_eq!(retry.next_backoff(), Some(Duration::from_millis(5)));
        assert_eq!(retry.next_backoff(), None);

        retry.reset();
        assert!(retry.next_backoff().is_some());
    }

    #[test]
    fn test_single_attempt_never_waits() {
        let mut retry = FixedRetry::new(Duration::from_millis(5), 0);
        assert_eq!(retry.next_backoff(), None);
    }

    #[tokio::test]
    async fn test_transient_errors_use_every_attempt() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), ExchangeError> = backoff::future::retry(
            FixedRetry::new(Duration::from_millis(1), 4),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(classify(ExchangeError::Transient("timeout".into())))
            },
        )
        .await;

        tokio_test::assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rejection_stops_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), ExchangeError> = backoff::future::retry(
            FixedRetry::new(Duration::from_millis(1), 4),
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(classify(ExchangeError::rejected(-2021, "would trigger")))
            },
        )
        .await;

        tokio_test::assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
