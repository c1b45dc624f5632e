//! Retry, backoff, and timeout utilities.
//!
//! `RetryPolicy` drives bounded retries for REST calls, including waits the
//! server asks for through `Retry-After`. `ReconnectBackoff` drives the
//! unbounded reconnect loop of the stream client.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Policy controlling retry attempts and exponential backoff behavior.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
    /// Longest server-requested wait (`Retry-After`) that is still honored.
    /// Longer requests fail immediately.
    pub max_retry_after: Duration,
}

impl RetryPolicy {
    /// Returns the default policy for signals API requests.
    pub fn api_default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
            jitter: Duration::from_millis(100),
            max_retry_after: Duration::from_secs(5),
        }
    }

    /// Same policy limited to one attempt, for requests that must not be
    /// replayed.
    pub fn single_attempt(&self) -> Self {
        Self {
            max_attempts: 1,
            ..self.clone()
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based and should correspond to the current attempt index.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter, attempt)
    }

    /// Wait before the next attempt, or `None` to give up.
    fn wait_for(&self, attempt: usize, decision: RetryDecision) -> Option<Duration> {
        if attempt >= self.max_attempts.max(1) {
            return None;
        }
        match decision {
            RetryDecision::Stop => None,
            RetryDecision::Backoff => Some(self.delay_for_attempt(attempt)),
            RetryDecision::After(wait) if wait <= self.max_retry_after => Some(wait),
            RetryDecision::After(_) => None,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::api_default()
    }
}

/// How a failed attempt is followed up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Permanent failure; return the error.
    Stop,
    /// Transient failure; retry after the policy's exponential delay.
    Backoff,
    /// The server named a wait; retry after it if the policy allows.
    After(Duration),
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number. `classify` decides, per error,
/// whether and when to try again.
pub async fn retry_async<T, E, Op, Fut, Classify>(
    policy: &RetryPolicy,
    mut op: Op,
    mut classify: Classify,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Classify: FnMut(&E) -> RetryDecision,
{
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        let decision = classify(&error);
        let Some(delay) = policy.wait_for(attempt, decision) else {
            return Err(error);
        };

        debug!(
            event = "retry_attempt_failed",
            attempt,
            max_attempts = policy.max_attempts,
            decision = ?decision,
            delay_ms = delay.as_millis() as u64
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

/// Exponential reconnect delay without an attempt limit.
///
/// The delay handed out for failure `n` (1-based) is
/// `min(floor * 2^(n-1), ceiling)`. `reset` returns to the floor.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    /// Creates a backoff starting at `floor` and never exceeding `ceiling`.
    ///
    /// A ceiling below the floor is raised to the floor.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Delay that the next wait will use.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay to wait now and doubles the stored delay for the
    /// following failure, capped at the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.ceiling);
        delay
    }

    /// Drops back to the floor after a successful authentication.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{retry_async, ReconnectBackoff, RetryDecision, RetryPolicy};

    fn no_jitter(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            jitter: Duration::ZERO,
            max_retry_after: Duration::from_secs(5),
        }
    }

    async fn failing_calls(
        policy: &RetryPolicy,
        failures: usize,
        decision: RetryDecision,
    ) -> (Result<&'static str, &'static str>, usize) {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = retry_async(
            policy,
            {
                let calls = Arc::clone(&calls);
                move |_| {
                    let calls = Arc::clone(&calls);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < failures {
                            Err("failed")
                        } else {
                            Ok("ok")
                        }
                    }
                }
            },
            |_| decision,
        )
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn retries_until_success() {
        let (result, calls) = failing_calls(&no_jitter(3), 2, RetryDecision::Backoff).await;
        assert_eq!(result.expect("success"), "ok");
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (result, calls) = failing_calls(&no_jitter(3), 10, RetryDecision::Backoff).await;
        assert_eq!(result.expect_err("exhausted"), "failed");
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn stop_decision_returns_first_error() {
        let (result, calls) = failing_calls(&no_jitter(5), 10, RetryDecision::Stop).await;
        assert_eq!(result.expect_err("expected failure"), "failed");
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn single_attempt_never_retries() {
        let policy = no_jitter(5).single_attempt();
        let (result, calls) = failing_calls(&policy, 1, RetryDecision::Backoff).await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_requested_wait_is_honored() {
        let started = tokio::time::Instant::now();
        let (result, calls) =
            failing_calls(&no_jitter(3), 1, RetryDecision::After(Duration::from_secs(3))).await;
        assert_eq!(result.expect("success"), "ok");
        assert_eq!(calls, 2);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn server_requested_wait_beyond_cap_fails_fast() {
        let started = tokio::time::Instant::now();
        let (result, calls) =
            failing_calls(&no_jitter(3), 1, RetryDecision::After(Duration::from_secs(60))).await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn retry_delay_doubles_up_to_max_backoff() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(25),
            ..no_jitter(5)
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(25));
    }

    #[test]
    fn three_failures_wait_one_two_four() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let waits: Vec<_> = (0..3).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            waits,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn backoff_matches_closed_form_and_caps_at_ceiling() {
        let floor = Duration::from_secs(1);
        let ceiling = Duration::from_secs(60);
        let mut backoff = ReconnectBackoff::new(floor, ceiling);
        for n in 1..=12u32 {
            let expected = std::cmp::min(floor * 2u32.pow(n - 1), ceiling);
            assert_eq!(backoff.next_delay(), expected, "attempt {n}");
        }
        assert_eq!(backoff.current(), ceiling);
    }

    #[test]
    fn backoff_reset_returns_to_floor() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(100), Duration::from_secs(2));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_millis(400));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn backoff_ceiling_below_floor_is_raised() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }
}
