// Calflow Ingest - Asynchronous ingestion coordinator
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Bounded retry for sink calls
//!
//! Every call is wrapped in a timeout; a timed-out call counts as a failed
//! attempt. The strategy decides how long to wait before the next attempt
//! and when to give up.

use std::future::Future;
use std::time::Duration;

use crate::error::{SinkDeliveryError, SinkError, SinkKind};

/// Retry strategy for sink delivery
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RetryStrategy {
    /// No retries
    #[default]
    None,
    /// Fixed number of retries with constant delay
    Fixed {
        /// Maximum number of retry attempts
        max_retries: u32,
        /// Delay between retries
        delay: Duration,
    },
    /// Exponential backoff
    ExponentialBackoff {
        /// Maximum number of retry attempts
        max_retries: u32,
        /// Initial delay
        initial_delay: Duration,
        /// Maximum delay
        max_delay: Duration,
        /// Multiplier for each attempt
        multiplier: f64,
    },
    /// Linear backoff
    LinearBackoff {
        /// Maximum number of retry attempts
        max_retries: u32,
        /// Initial delay
        initial_delay: Duration,
        /// Increment per attempt
        increment: Duration,
        /// Maximum delay
        max_delay: Duration,
    },
}

impl RetryStrategy {
    /// Calculate delay before retry number `attempt` (0-indexed)
    ///
    /// Returns None once retries are exhausted.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed { max_retries, delay } => (attempt < *max_retries).then_some(*delay),
            Self::ExponentialBackoff {
                max_retries,
                initial_delay,
                max_delay,
                multiplier,
            } => {
                if attempt < *max_retries {
                    let delay_ms =
                        initial_delay.as_millis() as f64 * multiplier.powi(attempt as i32);
                    let delay = Duration::from_millis(delay_ms as u64);
                    Some(delay.min(*max_delay))
                } else {
                    None
                }
            }
            Self::LinearBackoff {
                max_retries,
                initial_delay,
                increment,
                max_delay,
            } => {
                if attempt < *max_retries {
                    let delay = *initial_delay + (*increment * attempt);
                    Some(delay.min(*max_delay))
                } else {
                    None
                }
            }
        }
    }

    /// Maximum number of retries
    pub fn max_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_retries, .. }
            | Self::ExponentialBackoff { max_retries, .. }
            | Self::LinearBackoff { max_retries, .. } => *max_retries,
        }
    }

    /// Create a fixed retry strategy
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::Fixed { max_retries, delay }
    }

    /// Create an exponential backoff strategy (doubling, capped at 2 s)
    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        Self::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }

    /// Create a linear backoff strategy
    pub fn linear(max_retries: u32, initial_delay: Duration, increment: Duration) -> Self {
        Self::LinearBackoff {
            max_retries,
            initial_delay,
            increment,
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Successful delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    /// Number of calls made, including the successful one
    pub attempts: u32,
}

/// Run a sink call until it succeeds or the strategy gives up
///
/// Each call gets `timeout`; expiry is reported as [`SinkError::Timeout`].
pub async fn deliver<F, Fut>(
    sink: SinkKind,
    strategy: &RetryStrategy,
    timeout: Duration,
    mut operation: F,
) -> Result<Delivered, SinkDeliveryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), SinkError>>,
{
    let mut attempt = 0;
    loop {
        let error = match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(())) => {
                return Ok(Delivered {
                    attempts: attempt + 1,
                })
            }
            Ok(Err(e)) => e,
            Err(_) => SinkError::Timeout(timeout),
        };

        match strategy.delay_for_attempt(attempt) {
            Some(delay) => {
                tracing::debug!(
                    sink = %sink,
                    attempt = attempt + 1,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "sink call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => {
                return Err(SinkDeliveryError {
                    sink,
                    attempts: attempt + 1,
                    last_error: error,
                })
            }
        }
    }
}
