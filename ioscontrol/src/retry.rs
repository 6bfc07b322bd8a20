//! Blocking retry for fallible device operations.
//!
//! A [`Retrier`] is an immutable builder: every `with_*` returns a new
//! value, and a retrier holds no call state, so one instance can drive any
//! number of operations. Recovery is pluggable through an async handler
//! that inspects each failure and answers with a [`RecoveryAction`]; the
//! drivers use this to mount developer images, reinstall applications and
//! restart devices between attempts.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use log::{debug, warn};

/// What a recovery handler wants done about a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Try the operation again after the configured delay.
    Retry,
    /// Give up now; the caller receives the first failure.
    Fail,
}

/// Retries an async operation a bounded number of times.
#[derive(Clone, Copy, Debug)]
pub struct Retrier {
    max_attempts: u32,
    delay: Duration,
    delayed_first_attempt: bool,
}

impl Default for Retrier {
    fn default() -> Self {
        Retrier::new()
    }
}

impl Retrier {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// A retrier with the default number of attempts, no delay between
    /// attempts, and no recovery handler.
    pub fn new() -> Self {
        Retrier {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            delay: Duration::ZERO,
            delayed_first_attempt: false,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        assert!(max_attempts > 0, "max_attempts must be positive");
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Also sleeps the configured delay before the first attempt.
    pub fn with_delayed_first_attempt(mut self) -> Self {
        self.delayed_first_attempt = true;
        self
    }

    /// Runs `op` until it succeeds or the attempts are exhausted, retrying
    /// every failure.
    pub async fn run<T, E, Op, Fut>(&self, op: Op) -> Result<T, E>
    where
        E: Display,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with_handler(op, |_| async { Ok(RecoveryAction::Retry) })
            .await
    }

    /// Runs `op` until it succeeds or the attempts are exhausted, asking
    /// `handler` after every failure.
    ///
    /// The FIRST failure is the primary outcome: it is what the caller
    /// receives when the attempts are exhausted, when the handler answers
    /// [`RecoveryAction::Fail`], or when the handler itself fails. Later
    /// failures are logged as suppressed. A failing handler ends the run
    /// immediately with the primary failure.
    pub async fn run_with_handler<T, E, Op, Fut, H, HFut>(
        &self,
        mut op: Op,
        mut handler: H,
    ) -> Result<T, E>
    where
        E: Display,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        H: FnMut(&E) -> HFut,
        HFut: Future<Output = Result<RecoveryAction, E>>,
    {
        if self.delayed_first_attempt {
            tokio::time::sleep(self.delay).await;
        }

        let mut primary: Option<E> = None;
        for attempt in 1..=self.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(failure) => {
                    let action = handler(&failure).await;
                    if primary.is_none() {
                        primary = Some(failure);
                    } else {
                        debug!("suppressed failure on attempt {attempt}: {failure}");
                    }
                    match action {
                        Ok(RecoveryAction::Retry) => {}
                        Ok(RecoveryAction::Fail) => break,
                        Err(handler_failure) => {
                            warn!("recovery handler failed: {handler_failure}");
                            break;
                        }
                    }
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.delay).await;
            }
        }

        Err(primary.expect("at least one attempt was made"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let retrier = Retrier::new();
        let result: Result<i32, String> = retrier.run(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn succeeds_after_failed_attempts() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let result: Result<u32, String> = Retrier::new()
            .run(move || async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < Retrier::DEFAULT_MAX_ATTEMPTS {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), Retrier::DEFAULT_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn primary_failure_is_the_first_one() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let result: Result<(), String> = Retrier::new()
            .run(move || async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("failure {n}"))
            })
            .await;
        assert_eq!(result.unwrap_err(), "failure 1");
        assert_eq!(attempts.load(Ordering::SeqCst), Retrier::DEFAULT_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn single_attempt_never_retries() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let result: Result<(), String> = Retrier::new()
            .with_max_attempts(1)
            .run(move || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("only once".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_handler_stops_with_primary() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let result: Result<(), String> = Retrier::new()
            .run_with_handler(
                move || async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("task failure".to_string())
                },
                |_| async { Err("handler failure".to_string()) },
            )
            .await;
        assert_eq!(result.unwrap_err(), "task failure");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_fail_action_stops_with_primary() {
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let result: Result<(), String> = Retrier::new()
            .run_with_handler(
                move || async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(format!("failure {n}"))
                },
                |failure| {
                    let fatal = failure.contains("2");
                    async move {
                        Ok(if fatal {
                            RecoveryAction::Fail
                        } else {
                            RecoveryAction::Retry
                        })
                    }
                },
            )
            .await;
        assert_eq!(result.unwrap_err(), "failure 1");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handler_can_recover_between_attempts() {
        let attempts = AtomicU32::new(0);
        let repaired = AtomicU32::new(0);
        let attempts = &attempts;
        let repaired = &repaired;
        let result: Result<&str, String> = Retrier::new()
            .with_max_attempts(2)
            .run_with_handler(
                move || async move {
                    if repaired.load(Ordering::SeqCst) == 0 {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err("broken".to_string())
                    } else {
                        Ok("fixed")
                    }
                },
                move |_| async move {
                    repaired.fetch_add(1, Ordering::SeqCst);
                    Ok(RecoveryAction::Retry)
                },
            )
            .await;
        assert_eq!(result.unwrap(), "fixed");
        assert_eq!(repaired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_first_attempt_sleeps_before_running() {
        let started = tokio::time::Instant::now();
        let result: Result<(), String> = Retrier::new()
            .with_delay(Duration::from_secs(3))
            .with_delayed_first_attempt()
            .with_max_attempts(1)
            .run(|| async { Ok(()) })
            .await;
        result.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_between_attempts() {
        let started = tokio::time::Instant::now();
        let result: Result<(), String> = Retrier::new()
            .with_max_attempts(3)
            .with_delay(Duration::from_secs(1))
            .run(|| async { Err("nope".to_string()) })
            .await;
        assert!(result.is_err());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
