//! Retry policy and backoff calculation.
//!
//! Provides the types and math for retry logic. The async execution (sleeps,
//! cancellation, randomness) lives in `tether-runtime`; this module holds the
//! portable building blocks:
//!
//! - [`RetryPolicy`]: validated retry parameters for one service class
//! - [`RetryPolicy::backoff_delay`]: capped exponential backoff
//! - [`apply_jitter`]: full jitter with a caller-supplied random factor

use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;

use crate::errors::ErrorKind;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Invalid retry policy parameters.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum PolicyError {
    /// `max_attempts` must be at least 1.
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    /// `max_delay` must be strictly greater than `base_delay`.
    #[error("max_delay ({max_delay:?}) must be greater than base_delay ({base_delay:?})")]
    DelayOrder {
        /// Configured base delay.
        base_delay: Duration,
        /// Configured maximum delay.
        max_delay: Duration,
    },
    /// `multiplier` must be finite and greater than 1.
    #[error("multiplier must be a finite value greater than 1, got {0}")]
    Multiplier(f64),
}

// ─────────────────────────────────────────────────────────────────────────────
// RetryPolicy
// ─────────────────────────────────────────────────────────────────────────────

/// Execution strategy for one class of external dependency.
///
/// Invariants are enforced by [`RetryPolicy::new`]; a constructed policy is
/// always usable.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    retryable: BTreeSet<ErrorKind>,
}

impl RetryPolicy {
    /// Build a policy, validating its parameters.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter: bool,
        retryable: impl IntoIterator<Item = ErrorKind>,
    ) -> Result<Self, PolicyError> {
        if max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        if max_delay <= base_delay {
            return Err(PolicyError::DelayOrder {
                base_delay,
                max_delay,
            });
        }
        if !multiplier.is_finite() || multiplier <= 1.0 {
            return Err(PolicyError::Multiplier(multiplier));
        }
        Ok(Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier,
            jitter,
            retryable: retryable.into_iter().collect(),
        })
    }

    /// Maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the first retry.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Upper bound on any single delay.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Growth factor between successive delays.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Whether delays are randomized.
    pub fn jitter(&self) -> bool {
        self.jitter
    }

    /// Kinds this policy retries.
    pub fn retryable_error_kinds(&self) -> &BTreeSet<ErrorKind> {
        &self.retryable
    }

    /// Whether a failure of `kind` is retried.
    pub fn retries(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based).
    ///
    /// `min(max_delay, base_delay * multiplier^(attempt - 1))`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Delay after failed attempt `attempt`, jittered with `random` in
    /// `[0.0, 1.0]` when the policy enables jitter.
    pub fn delay_with_random(&self, attempt: u32, random: f64) -> Duration {
        let delay = self.backoff_delay(attempt);
        if self.jitter {
            apply_jitter(delay, random)
        } else {
            delay
        }
    }
}

/// Full jitter: scale `delay` by `random`, clamped into `[0.0, 1.0]`.
///
/// The result always lies in `[0, delay]`.
pub fn apply_jitter(delay: Duration, random: f64) -> Duration {
    if random.is_nan() || random <= 0.0 {
        return Duration::ZERO;
    }
    if random >= 1.0 {
        return delay;
    }
    delay.mul_f64(random)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn secs_policy(jitter: bool) -> RetryPolicy {
        RetryPolicy::new(
            6,
            Duration::from_secs(1),
            Duration::from_secs(10),
            2.0,
            jitter,
            [ErrorKind::Timeout],
        )
        .unwrap()
    }

    #[test]
    fn rejects_zero_attempts() {
        let err = RetryPolicy::new(
            0,
            Duration::from_millis(1),
            Duration::from_millis(2),
            2.0,
            false,
            [ErrorKind::Timeout],
        );
        assert_matches!(err, Err(PolicyError::ZeroAttempts));
    }

    #[test]
    fn rejects_max_delay_not_above_base() {
        let err = RetryPolicy::new(
            3,
            Duration::from_secs(5),
            Duration::from_secs(5),
            2.0,
            false,
            [ErrorKind::Timeout],
        );
        assert_matches!(err, Err(PolicyError::DelayOrder { .. }));
    }

    #[test]
    fn rejects_multiplier_at_or_below_one() {
        for m in [1.0, 0.5, f64::NAN, f64::INFINITY] {
            let err = RetryPolicy::new(
                3,
                Duration::from_millis(1),
                Duration::from_millis(10),
                m,
                false,
                [ErrorKind::Timeout],
            );
            assert_matches!(err, Err(PolicyError::Multiplier(_)));
        }
    }

    #[test]
    fn backoff_sequence_without_jitter() {
        let policy = secs_policy(false);
        let waits: Vec<u64> = (1..=6)
            .map(|a| policy.delay_with_random(a, 0.3).as_secs())
            .collect();
        assert_eq!(waits, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn backoff_high_attempt_no_overflow() {
        let policy = secs_policy(false);
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn zero_base_delay_never_waits() {
        let policy = RetryPolicy::new(
            3,
            Duration::ZERO,
            Duration::from_secs(1),
            3.0,
            false,
            [ErrorKind::Timeout],
        )
        .unwrap();
        assert_eq!(policy.backoff_delay(40), Duration::ZERO);
    }

    #[test]
    fn jitter_scales_delay() {
        let policy = secs_policy(true);
        assert_eq!(policy.delay_with_random(2, 0.5), Duration::from_secs(1));
        assert_eq!(policy.delay_with_random(2, 0.0), Duration::ZERO);
        assert_eq!(policy.delay_with_random(2, 1.0), Duration::from_secs(2));
    }

    #[test]
    fn jitter_clamps_out_of_range_factor() {
        let d = Duration::from_millis(400);
        assert_eq!(apply_jitter(d, 7.0), d);
        assert_eq!(apply_jitter(d, -1.0), Duration::ZERO);
        assert_eq!(apply_jitter(d, f64::NAN), Duration::ZERO);
    }

    #[test]
    fn retries_only_declared_kinds() {
        let policy = secs_policy(false);
        assert!(policy.retries(ErrorKind::Timeout));
        assert!(!policy.retries(ErrorKind::Network));
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_within_computed(attempt in 1u32..64, random in 0.0f64..=1.0) {
            let policy = secs_policy(true);
            let computed = policy.backoff_delay(attempt);
            let jittered = policy.delay_with_random(attempt, random);
            prop_assert!(jittered <= computed);
            prop_assert!(computed <= policy.max_delay());
        }

        #[test]
        fn backoff_is_monotonic(attempt in 1u32..200) {
            let policy = secs_policy(false);
            prop_assert!(policy.backoff_delay(attempt) <= policy.backoff_delay(attempt + 1));
        }
    }
}
