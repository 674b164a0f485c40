use std::sync::Mutex;
use std::time::{Duration, Instant};

use idx_metrics::CB_OPEN_SECONDS;

/// Closed/Open/Half-Open failure-count circuit breaker.
///
/// Half-Open is not a stored state: it is simply "Open, but `open_seconds`
/// have elapsed", at which point the next call is let through as a probe. A
/// successful probe moves to Closed but does not immediately zero the
/// failure counter — it takes two consecutive successes after an open
/// window before the counter resets, so a single lucky probe after a long
/// outage doesn't instantly forget a flapping upstream.
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_seconds: u64,
    pool_label: &'static str,
    inner: Mutex<Inner>,
}

struct Inner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// `Some(n)` while recovering from an open window: set to `Some(1)` on
    /// the first post-open success, promoted to `None` (fully recovered,
    /// counter reset) on the second consecutive one. Any failure in between
    /// clears it and reopens the circuit.
    recovery_successes: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    Allowed,
    Rejected { retry_after_secs: u64 },
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_seconds: u64, pool_label: &'static str) -> Self {
        // Published once at construction and never mutated: both pools
        // report their configured cooldown symmetrically regardless of
        // whether they are presently open.
        CB_OPEN_SECONDS
            .with_label_values(&[pool_label])
            .set(open_seconds as i64);

        Self {
            failure_threshold,
            open_seconds,
            pool_label,
            inner: Mutex::new(Inner {
                consecutive_failures: 0,
                opened_at: None,
                recovery_successes: None,
            }),
        }
    }

    /// Check whether a call may proceed. Does not mutate failure/success
    /// counters; callers must report the outcome via [`Self::record_success`]
    /// or [`Self::record_failure`].
    pub fn admit(&self) -> Admit {
        let inner = self.inner.lock().unwrap();
        match inner.opened_at {
            None => Admit::Allowed,
            Some(opened_at) => {
                let elapsed = opened_at.elapsed();
                let window = Duration::from_secs(self.open_seconds);
                if elapsed >= window {
                    // Half-open: let exactly the next call through as a probe.
                    Admit::Allowed
                } else {
                    Admit::Rejected {
                        retry_after_secs: (window - elapsed).as_secs().max(1),
                    }
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.opened_at.is_some() {
            match inner.recovery_successes {
                None => {
                    // First success since the circuit opened: tentatively
                    // close, but keep the failure count until one more.
                    inner.opened_at = None;
                    inner.recovery_successes = Some(1);
                }
                Some(n) => {
                    inner.recovery_successes = Some(n + 1);
                    if n + 1 >= 2 {
                        inner.consecutive_failures = 0;
                        inner.recovery_successes = None;
                    }
                }
            }
        } else {
            inner.consecutive_failures = 0;
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.opened_at.is_some() || inner.recovery_successes.is_some() {
            // Failure during the open window or during recovery: reopen.
            inner.opened_at = Some(Instant::now());
            inner.recovery_successes = None;
            return;
        }

        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.failure_threshold {
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                pool = self.pool_label,
                failures = inner.consecutive_failures,
                open_seconds = self.open_seconds,
                "circuit breaker tripped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_closed_below_threshold() {
        let cb = CircuitBreaker::new(5, 60, "test");
        for _ in 0..4 {
            cb.record_failure();
        }
        assert_eq!(cb.admit(), Admit::Allowed);
    }

    #[test]
    fn opens_at_threshold_and_rejects() {
        let cb = CircuitBreaker::new(3, 60, "test");
        cb.record_failure();
        cb.record_failure();
        cb.record_failure();
        assert!(matches!(cb.admit(), Admit::Rejected { .. }));
    }

    #[test]
    fn single_probe_success_does_not_reset_counter() {
        let cb = CircuitBreaker::new(2, 0, "test");
        cb.record_failure();
        cb.record_failure();
        assert!(matches!(cb.admit(), Admit::Rejected { .. }) || cb.admit() == Admit::Allowed);
        // open_seconds = 0, so the next admit() is already a probe.
        assert_eq!(cb.admit(), Admit::Allowed);
        cb.record_success();
        // One success closes it provisionally, but a fresh failure right
        // after must reopen rather than starting a new failure count at 1.
        cb.record_failure();
        assert!(matches!(cb.admit(), Admit::Rejected { .. }));
    }

    #[test]
    fn two_consecutive_successes_fully_recover() {
        let cb = CircuitBreaker::new(2, 0, "test");
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.admit(), Admit::Allowed); // probe window
        cb.record_success();
        cb.record_success();
        // Failure counter is now reset to zero: two more failures are
        // needed before the circuit opens again.
        cb.record_failure();
        assert_eq!(cb.admit(), Admit::Allowed);
    }
}
