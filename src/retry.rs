use std::fmt::Display;
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

/// Caller-side retry around a single call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            backoff: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration, backoff: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: if backoff.is_finite() && backoff >= 1.0 {
                backoff
            } else {
                1.0
            },
        }
    }

    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, 1.0)
    }

    /// Pause before attempt `attempt + 1`, `attempt` counting from 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff.powi(attempt.saturating_sub(1) as i32);
        self.delay.mul_f64(factor)
    }

    /// Runs `op` until it succeeds or the attempts are spent; the last error
    /// is returned.
    pub fn run<T, E, F>(&self, label: &str, op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_if(label, op, |_| true)
    }

    /// Like [`RetryPolicy::run`], but errors rejected by `retryable` are
    /// returned at once.
    pub fn run_if<T, E, F, P>(&self, label: &str, mut op: F, retryable: P) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts || !retryable(&err) => {
                    if attempt > 1 {
                        error!("{label} failed after {attempt} attempts: {err}");
                    }
                    return Err(err);
                }
                Err(err) => {
                    let pause = self.delay_after(attempt);
                    warn!(
                        "{label} failed (attempt {attempt}/{attempts}): {err}. Retrying in {:.1}s",
                        pause.as_secs_f64()
                    );
                    thread::sleep(pause);
                    attempt += 1;
                }
            }
        }
    }

    /// Boolean form of [`RetryPolicy::run`] for outcome-returning calls.
    pub fn run_until<F>(&self, label: &str, mut op: F) -> bool
    where
        F: FnMut(u32) -> bool,
    {
        self.run(label, |attempt| if op(attempt) { Ok(()) } else { Err("unsuccessful") })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_by_backoff() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100), 2.0);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn stops_at_first_success() {
        let policy = RetryPolicy::new(5, Duration::ZERO, 1.0);
        let mut calls = 0;
        let result: Result<u32, String> = policy.run("op", |attempt| {
            calls += 1;
            if attempt == 2 { Ok(attempt) } else { Err("boom".to_string()) }
        });
        assert_eq!(result, Ok(2));
        assert_eq!(calls, 2);
    }

    #[test]
    fn returns_last_error_when_exhausted() {
        let policy = RetryPolicy::new(3, Duration::ZERO, 1.0);
        let mut calls = 0;
        let ok = policy.run_until("op", |_| {
            calls += 1;
            false
        });
        assert!(!ok);
        assert_eq!(calls, 3);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, Duration::ZERO, 1.0);
        let mut calls = 0;
        let result: Result<(), &str> = policy.run_if(
            "op",
            |attempt| {
                calls += 1;
                Err(if attempt < 2 { "transient" } else { "permanent" })
            },
            |err| *err == "transient",
        );
        assert_eq!(result, Err("permanent"));
        assert_eq!(calls, 2);
    }

    #[test]
    fn invalid_parameters_are_clamped() {
        let policy = RetryPolicy::new(0, Duration::ZERO, 0.5);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.backoff, 1.0);
    }
}
