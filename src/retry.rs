use std::time::Duration;

use crate::{ClientOptions, RequestDescriptor};

/// Why an attempt failed, as far as retry is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    /// No response: connection error or timeout.
    NoResponse,
    /// A response arrived with this non-success status.
    Status(u16),
}

impl Failure {
    pub fn is_network(self) -> bool {
        matches!(self, Self::NoResponse)
    }
}

/// Bounded exponential backoff without jitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl From<&ClientOptions> for RetryPolicy {
    fn from(options: &ClientOptions) -> Self {
        Self {
            max_retries: options.max_retries,
            base_delay: Duration::from_millis(options.retry_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Network failures and 5xx responses are retried while the descriptor
    /// has retries left. Anything below 500, 401 included, is not.
    pub fn should_retry(&self, descriptor: &RequestDescriptor, failure: Failure) -> bool {
        if !descriptor.auto_retry() {
            return false;
        }
        let eligible = match failure {
            Failure::NoResponse => true,
            Failure::Status(status) => status >= 500,
        };
        eligible && descriptor.retry_context().attempt < self.max_retries
    }

    /// `base * 2^attempt_index`.
    pub fn next_delay(&self, attempt_index: u32) -> Duration {
        let multiplier = 1u32 << attempt_index.min(16);
        self.base_delay.saturating_mul(multiplier)
    }
}
