//! Bounded retry with exponential backoff for durable writes.
//!
//! Only transient storage failures are retried. Rejections raised inside a
//! storage transaction (a stale license, an invariant the batch would break)
//! come back on the first attempt.

use std::time::{Duration, Instant};

use sled::transaction::TransactionError;

use crate::error::EngineError;

pub(crate) enum WriteError {
    /// The durability layer refused or failed the write; nothing was committed
    Transient(String),
    Rejected(EngineError),
}

impl From<TransactionError<EngineError>> for WriteError {
    fn from(value: TransactionError<EngineError>) -> Self {
        match value {
            TransactionError::Abort(e) => WriteError::Rejected(e),
            TransactionError::Storage(e) => WriteError::Transient(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on the whole write including backoff
    pub write_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(400),
            write_timeout: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base... capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub(crate) fn run<T>(
        &self,
        operation: &str,
        mut attempt: impl FnMut() -> Result<T, WriteError>,
    ) -> Result<T, EngineError> {
        let started = Instant::now();
        let mut tries = 0;

        loop {
            tries += 1;
            let reason = match attempt() {
                Ok(value) => return Ok(value),
                Err(WriteError::Rejected(e)) => return Err(e),
                Err(WriteError::Transient(reason)) => reason,
            };

            let delay = self.delay_for(tries);
            if tries >= self.max_attempts || started.elapsed() + delay > self.write_timeout {
                tracing::error!(
                    attempts = tries,
                    "{operation} abandoned, nothing was committed: {reason}"
                );
                return Err(EngineError::LedgerWriteFailure {
                    attempts: tries,
                    reason,
                });
            }

            tracing::warn!(
                attempt = tries,
                max_attempts = self.max_attempts,
                "{operation} failed, retrying in {delay:?}: {reason}"
            );
            std::thread::sleep(delay);
        }
    }
}
