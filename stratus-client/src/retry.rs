use std::time::Duration;

use rand::Rng;

use crate::error::TransportError;

/// How a failure should be handled by the retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: worth retrying with backoff.
    Retryable,
    /// Authorization-related: worth exactly one forced credential refresh.
    Auth,
    /// Permanent: surface to the caller immediately.
    Fatal,
}

/// Upstream codes that indicate a transient condition.
const RETRYABLE_CODES: [&str; 6] = [
    "NETWORK_ERROR",
    "TIMEOUT",
    "INTERNAL_ERROR",
    "SERVICE_UNAVAILABLE",
    "THROTTLING_ERROR",
    "CONNECTION_ERROR",
];

/// Upstream codes that must never be retried.
const FATAL_CODES: [&str; 3] = ["VALIDATION_ERROR", "NOT_FOUND", "BAD_REQUEST"];

const AUTH_CODES: [&str; 2] = ["UNAUTHORIZED", "FORBIDDEN"];

/// Message fragments that mark a transient failure when neither a code nor
/// a status is available.
const RETRYABLE_MESSAGES: [&str; 4] = [
    "network error",
    "connection timeout",
    "service temporarily unavailable",
    "rate limit exceeded",
];

/// Pure retry decision logic: error classification and backoff delays.
///
/// The policy itself never sleeps; callers schedule the returned delays.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Policy for re-establishing a persistent connection: a larger attempt
    /// budget, same capped exponential backoff.
    pub fn for_reconnect() -> Self {
        Self {
            max_attempts: 5,
            ..Self::default()
        }
    }

    /// Classify a transport failure: explicit code first, then HTTP status
    /// ranges, then known message fragments. Anything unrecognized is
    /// `Fatal` so unknown failures never loop.
    pub fn classify(err: &TransportError) -> ErrorClass {
        if let Some(code) = err.code.as_deref() {
            if AUTH_CODES.contains(&code) {
                return ErrorClass::Auth;
            }
            if FATAL_CODES.contains(&code) {
                return ErrorClass::Fatal;
            }
            if RETRYABLE_CODES.contains(&code) {
                return ErrorClass::Retryable;
            }
        }

        if let Some(status) = err.status {
            if status == 401 || status == 403 {
                return ErrorClass::Auth;
            }
            if (500..600).contains(&status) || status == 429 {
                return ErrorClass::Retryable;
            }
        }

        let message = err.message.to_lowercase();
        if RETRYABLE_MESSAGES.iter().any(|m| message.contains(m)) {
            return ErrorClass::Retryable;
        }

        ErrorClass::Fatal
    }

    /// Backoff delay for the given zero-based attempt, without jitter:
    /// `base * multiplier^attempt`, capped at `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(31) as i32);
        let delay = self.base_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }

    /// Backoff delay with up to 10% random jitter added, still capped, so a
    /// shared outage does not produce synchronized retries.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = base.mul_f64(rand::rng().random_range(0.0..0.1));
        (base + jitter).min(self.max_delay)
    }

    /// Whether another attempt fits in the budget. `attempt` is the number
    /// of attempts already made.
    pub fn has_budget(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_prefers_explicit_codes() {
        // A retryable-looking status must not override an explicit code.
        let err = TransportError {
            code: Some("VALIDATION_ERROR".into()),
            status: Some(503),
            message: "bad input".into(),
            source: None,
        };
        assert_eq!(RetryPolicy::classify(&err), ErrorClass::Fatal);

        let err = TransportError::service("THROTTLING_ERROR", "slow down");
        assert_eq!(RetryPolicy::classify(&err), ErrorClass::Retryable);

        let err = TransportError::service("UNAUTHORIZED", "token invalid");
        assert_eq!(RetryPolicy::classify(&err), ErrorClass::Auth);
    }

    #[test]
    fn classify_falls_back_to_status_ranges() {
        assert_eq!(
            RetryPolicy::classify(&TransportError::status(503, "upstream down")),
            ErrorClass::Retryable
        );
        assert_eq!(
            RetryPolicy::classify(&TransportError::status(429, "throttled")),
            ErrorClass::Retryable
        );
        assert_eq!(
            RetryPolicy::classify(&TransportError::status(401, "denied")),
            ErrorClass::Auth
        );
        assert_eq!(
            RetryPolicy::classify(&TransportError::status(404, "missing")),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn classify_falls_back_to_message_fragments() {
        let err = TransportError::message("Network error while connecting");
        assert_eq!(RetryPolicy::classify(&err), ErrorClass::Retryable);
    }

    #[test]
    fn classify_defaults_to_fatal() {
        let err = TransportError::message("some entirely novel failure");
        assert_eq!(RetryPolicy::classify(&err), ErrorClass::Fatal);
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..12 {
            let delay = policy.base_delay(attempt);
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(10), policy.max_delay);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();
        for attempt in 0..5 {
            let base = policy.base_delay(attempt);
            for _ in 0..50 {
                let jittered = policy.jittered_delay(attempt);
                assert!(jittered >= base);
                assert!(jittered <= base.mul_f64(1.1).min(policy.max_delay));
            }
        }
    }

    #[test]
    fn reconnect_policy_has_five_attempts() {
        let policy = RetryPolicy::for_reconnect();
        assert_eq!(policy.max_attempts, 5);
        assert!(policy.has_budget(4));
        assert!(!policy.has_budget(5));
    }
}
