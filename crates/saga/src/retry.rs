//! Retry policy consulted before a step attempt is declared failed.

use std::time::Duration;

use common::ErrorKind;
use thiserror::Error;

/// Error returned when a [`RetryPolicy`] configuration is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid retry policy: {0}")]
pub struct RetryPolicyError(pub &'static str);

/// How long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed {
        /// Delay between attempts.
        delay: Duration,
    },
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        /// Delay after the first failed attempt.
        base: Duration,
        /// Growth factor per attempt.
        multiplier: u32,
        /// Upper bound on any single delay.
        max: Duration,
    },
}

impl Backoff {
    /// Returns the delay to wait after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential {
                base,
                multiplier,
                max,
            } => {
                let exponent = attempt.saturating_sub(1);
                multiplier
                    .checked_pow(exponent)
                    .and_then(|factor| base.checked_mul(factor))
                    .map_or(max, |delay| delay.min(max))
            }
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then try again.
    Retry {
        /// Time to wait before the next attempt.
        after: Duration,
    },
    /// Stop; the step has failed.
    GiveUp,
}

impl RetryDecision {
    /// Returns the wait before the next attempt, if there is one.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            RetryDecision::Retry { after } => Some(*after),
            RetryDecision::GiveUp => None,
        }
    }
}

/// Bounded retry configuration for one step direction.
///
/// Decisions depend only on the error kind and the attempt number, so they
/// are deterministic. There is no jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    retryable: fn(ErrorKind) -> bool,
}

impl RetryPolicy {
    /// Creates a policy with the default retryable predicate
    /// ([`ErrorKind::is_transient`]).
    pub fn new(max_attempts: u32, backoff: Backoff) -> Result<Self, RetryPolicyError> {
        if max_attempts == 0 {
            return Err(RetryPolicyError("max_attempts must be at least 1"));
        }
        if let Backoff::Exponential {
            base,
            multiplier,
            max,
        } = backoff
        {
            if multiplier == 0 {
                return Err(RetryPolicyError("multiplier must be greater than 0"));
            }
            if max < base {
                return Err(RetryPolicyError("max delay must be >= base delay"));
            }
        }
        Ok(Self {
            max_attempts,
            backoff,
            retryable: transient,
        })
    }

    /// Creates a policy waiting `delay` between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Result<Self, RetryPolicyError> {
        Self::new(max_attempts, Backoff::Fixed { delay })
    }

    /// Creates an exponential backoff policy.
    pub fn exponential(
        max_attempts: u32,
        base: Duration,
        multiplier: u32,
        max: Duration,
    ) -> Result<Self, RetryPolicyError> {
        Self::new(
            max_attempts,
            Backoff::Exponential {
                base,
                multiplier,
                max,
            },
        )
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed {
                delay: Duration::ZERO,
            },
            retryable: transient,
        }
    }

    /// Replaces the predicate deciding which error kinds are retryable.
    pub fn with_retryable(mut self, retryable: fn(ErrorKind) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff shape.
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Returns true if errors of this kind may be retried.
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        (self.retryable)(kind)
    }

    /// Decides what follows a failed attempt (1-based).
    pub fn decide(&self, kind: ErrorKind, attempt: u32) -> RetryDecision {
        if !self.is_retryable(kind) || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            after: self.backoff.delay_for_attempt(attempt),
        }
    }
}

impl Default for RetryPolicy {
    /// Three attempts, exponential backoff from 100ms doubling up to 10s,
    /// retrying network/timeout/unavailable errors only.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(100),
                multiplier: 2,
                max: Duration::from_secs(10),
            },
            retryable: transient,
        }
    }
}

fn transient(kind: ErrorKind) -> bool {
    kind.is_transient()
}
