//! Retry policy as an explicit, clock-free state machine: `(attempts,
//! next_delay, last_error)` advanced by a pure step function, rather than
//! an async loop wrapped around a closure.
//!
//! Grounded on the teacher's `resilience::retry_backoff` (`BackoffStrategy`,
//! jittered exponential delay), restructured per the redesign note calling
//! for a state machine that is fully testable without a clock.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Terminal,
}

/// What the caller should do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Wait this long, then try again.
    RetryAfter(Duration),
    /// Retries exhausted or the error was terminal; give up.
    GiveUp,
}

/// Pure state: no clock, no I/O. `step()` is the only transition.
#[derive(Debug, Clone)]
pub struct RetryState {
    config: RetryConfig,
    attempts: u32,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Advances the state after a failed attempt. `error` is recorded
    /// regardless of outcome so the caller can report it after giving up.
    pub fn step(&mut self, error: impl Into<String>, classification: Classification) -> StepOutcome {
        self.last_error = Some(error.into());
        if classification == Classification::Terminal {
            return StepOutcome::GiveUp;
        }
        if self.attempts >= self.config.max_retries {
            return StepOutcome::GiveUp;
        }
        let delay = self.next_delay();
        self.attempts += 1;
        StepOutcome::RetryAfter(delay)
    }

    /// `base_delay * 2^attempt` with up to 20% jitter, deterministic given
    /// `attempts` save for the jitter draw.
    fn next_delay(&self) -> Duration {
        let base = self.config.base_delay_ms as f64;
        let exp = base * 2f64.powi(self.attempts as i32);
        let jitter_frac: f64 = rand::thread_rng().gen_range(0.0..0.2);
        let jittered = exp * (1.0 + jitter_frac);
        Duration::from_millis(jittered.round() as u64)
    }
}

/// Drives an async operation to completion using [`RetryState`], sleeping
/// between attempts via `tokio::time::sleep`. `classify` maps the
/// operation's error type to [`Classification`].
pub async fn retry_with<F, Fut, T, E>(
    config: RetryConfig,
    mut op: F,
    classify: impl Fn(&E) -> Classification,
) -> std::result::Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut state = RetryState::new(config);
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let classification = classify(&e);
                match state.step(e.to_string(), classification) {
                    StepOutcome::RetryAfter(delay) => {
                        tokio::time::sleep(delay).await;
                    }
                    StepOutcome::GiveUp => {
                        return Err(state.last_error.unwrap_or_default());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 10,
        }
    }

    #[test]
    fn retries_up_to_max_then_gives_up() {
        let mut state = RetryState::new(config());
        for _ in 0..3 {
            assert!(matches!(
                state.step("x", Classification::Retryable),
                StepOutcome::RetryAfter(_)
            ));
        }
        assert_eq!(
            state.step("x", Classification::Retryable),
            StepOutcome::GiveUp
        );
    }

    #[test]
    fn terminal_error_gives_up_immediately() {
        let mut state = RetryState::new(config());
        assert_eq!(
            state.step("bad request", Classification::Terminal),
            StepOutcome::GiveUp
        );
        assert_eq!(state.attempts(), 0);
    }

    #[test]
    fn delay_grows_exponentially() {
        let mut state = RetryState::new(config());
        let StepOutcome::RetryAfter(d0) = state.step("x", Classification::Retryable) else {
            panic!()
        };
        let StepOutcome::RetryAfter(d1) = state.step("x", Classification::Retryable) else {
            panic!()
        };
        assert!(d1 > d0);
    }

    #[tokio::test]
    async fn retry_with_succeeds_after_transient_failures() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = retry_with(
            RetryConfig { max_retries: 5, base_delay_ms: 1 },
            || {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            },
            |_| Classification::Retryable,
        )
        .await;
        assert_eq!(result, Ok(42));
    }
}
