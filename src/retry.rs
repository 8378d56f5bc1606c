//! Reconnect back-off policy.
//!
//! Every adapter that owns a long-lived connection shares the same retry
//! rule: the first granted delay equals the configured start interval and
//! each later one doubles the previous, until the attempt counter reaches
//! the max-error limit. The counter accumulates for the lifetime of the
//! owning component; it is not reset by a successful connection.

use std::time::Duration;

use tracing::warn;

use crate::config::BrokerConfig;

/// Fallback when the configured max-error limit is zero.
const DEFAULT_MAX_ERROR: u32 = 5;

/// Back-off state for one connection component.
///
/// Pure state: [`next_delay`](Self::next_delay) only computes, while
/// [`pause`](Self::pause) additionally blocks the calling worker for the
/// granted delay. Exhaustion hands the triggering error back unmodified.
#[derive(Debug)]
pub struct ReconnectPolicy {
    auto_reconnect: bool,
    start_interval: Duration,
    max_error: u32,
    attempts: u32,
    delay: Option<Duration>,
}

impl ReconnectPolicy {
    /// Create a policy. A zero max-error limit falls back to 5.
    pub fn new(auto_reconnect: bool, start_interval: Duration, max_error: u32) -> Self {
        Self {
            auto_reconnect,
            start_interval,
            max_error: if max_error == 0 {
                DEFAULT_MAX_ERROR
            } else {
                max_error
            },
            attempts: 0,
            delay: None,
        }
    }

    /// Build the dial-failure policy for a broker configuration.
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            config.auto_reconnect,
            Duration::from_secs(config.start_interval),
            config.max_error,
        )
    }

    /// Failures recorded so far. Never resets on success.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record one failure and decide whether to retry.
    ///
    /// Returns the delay to wait before the next attempt, or `None` when
    /// the attempt budget is spent or auto-reconnect is disabled.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.max_error {
            return None;
        }
        if !self.auto_reconnect {
            return None;
        }
        let delay = match self.delay {
            None => self.start_interval,
            Some(previous) => previous * 2,
        };
        self.delay = Some(delay);
        Some(delay)
    }

    /// Record one failure and sleep out the granted delay.
    ///
    /// Blocking the caller is the backpressure mechanism: the worker that
    /// drives the connection waits here, nobody else. On refusal the
    /// triggering error is returned to the caller unmodified.
    pub async fn pause<E>(&mut self, err: E) -> Result<(), E> {
        match self.next_delay() {
            Some(delay) => {
                warn!(attempts = self.attempts, delay = ?delay, "reconnecting after back-off");
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_from_start_interval() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_secs(2), 5);
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(4)));
        // A third attempt is still within budget.
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(8)));
        assert_eq!(policy.attempts(), 3);
    }

    #[test]
    fn test_refuses_at_max_error() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_secs(2), 3);
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        // The third failure reaches the limit: no delay, no further retry.
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempts(), 3);
    }

    #[test]
    fn test_refuses_immediately_without_auto_reconnect() {
        let mut policy = ReconnectPolicy::new(false, Duration::from_secs(2), 5);
        assert_eq!(policy.next_delay(), None);
        // The failure still counts against the budget.
        assert_eq!(policy.attempts(), 1);
    }

    #[test]
    fn test_attempts_accumulate_across_successes() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_secs(1), 3);
        assert!(policy.next_delay().is_some());
        // A successful connection happens here; the policy has no reset and
        // the next outage keeps counting from where the last one stopped.
        assert!(policy.next_delay().is_some());
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn test_zero_max_error_falls_back_to_default() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_secs(1), 0);
        for _ in 0..4 {
            assert!(policy.next_delay().is_some());
        }
        assert_eq!(policy.next_delay(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_sleeps_then_returns_error_on_exhaustion() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_secs(2), 3);
        let before = tokio::time::Instant::now();
        policy.pause("boom").await.expect("first retry granted");
        assert_eq!(before.elapsed(), Duration::from_secs(2));
        policy.pause("boom").await.expect("second retry granted");
        assert_eq!(before.elapsed(), Duration::from_secs(6));
        // Exhaustion surfaces the original error value untouched.
        assert_eq!(policy.pause("boom").await, Err("boom"));
    }
}
