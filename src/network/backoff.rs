//! Reconnect backoff
//!
//! `delay(n) = min(base * multiplier^n, cap)`, optionally spread by a bounded
//! jitter so many clients dropped at once do not reconnect in lockstep.

use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{sleep, Instant, Sleep};

use crate::config::BackoffConfig;

/// Exponential backoff policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    multiplier: f64,
    cap: Duration,
    jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, multiplier: f64, cap: Duration) -> Self {
        Self {
            base,
            multiplier,
            cap,
            jitter_ratio: 0.0,
        }
    }

    /// Spread each delay uniformly over `[1 - ratio, 1 + ratio]`
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 0.5);
        self
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            config.multiplier,
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(config.jitter_ratio)
    }

    /// Deterministic delay before reconnect attempt `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let cap_ms = self.cap.as_millis() as f64;
        let exp = attempt.min(i32::MAX as u32) as i32;
        let raw_ms = self.base.as_millis() as f64 * self.multiplier.powi(exp);
        // powi overflows to inf for large attempts; min() absorbs it
        Duration::from_millis(raw_ms.min(cap_ms) as u64)
    }

    /// Delay with jitter applied, still bounded by the cap
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng()
            .gen_range(1.0 - self.jitter_ratio..=1.0 + self.jitter_ratio);
        delay.mul_f64(factor).min(self.cap)
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), 1.5, Duration::from_millis(30_000))
    }
}

/// The single pending reconnect timer
///
/// Only the retrying phase of the connection owns one, so there is never
/// more than one in flight. Dropping it cancels the retry.
#[derive(Debug)]
pub struct ReconnectTimer {
    sleep: Pin<Box<Sleep>>,
    attempt: u32,
    delay: Duration,
}

impl ReconnectTimer {
    pub fn schedule(policy: &BackoffPolicy, attempt: u32) -> Self {
        let delay = policy.jittered_delay(attempt);
        Self {
            sleep: Box::pin(sleep(delay)),
            attempt,
            delay,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn deadline(&self) -> Instant {
        self.sleep.deadline()
    }
}

impl Future for ReconnectTimer {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.sleep.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_default_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(1000));
        assert_eq!(policy.delay(1), Duration::from_millis(1500));
        assert_eq!(policy.delay(2), Duration::from_millis(2250));
        assert_eq!(policy.delay(8), Duration::from_millis(25_628));
        assert_eq!(policy.delay(9), Duration::from_millis(30_000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let policy = BackoffPolicy::default().with_jitter(0.1);
        for attempt in 0..20 {
            let base = policy.delay(attempt).as_millis() as f64;
            let jittered = policy.jittered_delay(attempt).as_millis() as f64;
            assert!(jittered + 1.0 >= base * 0.9);
            assert!(jittered <= base * 1.1 + 1.0);
            assert!(jittered <= 30_000.0);
        }
    }

    #[test]
    fn test_jitter_ratio_is_clamped() {
        let policy = BackoffPolicy::default().with_jitter(3.0);
        assert_eq!(policy.jitter_ratio, 0.5);
    }

    proptest! {
        #[test]
        fn delay_matches_formula(n in 0u32..200) {
            let expected = (1000.0 * 1.5f64.powi(n as i32)).min(30_000.0) as u64;
            prop_assert_eq!(BackoffPolicy::default().delay(n).as_millis() as u64, expected);
        }

        #[test]
        fn delay_is_monotonic_and_capped(n in 0u32..10_000) {
            let policy = BackoffPolicy::default();
            prop_assert!(policy.delay(n) <= policy.delay(n + 1));
            prop_assert!(policy.delay(n) <= policy.cap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let timer = ReconnectTimer::schedule(&BackoffPolicy::default(), 1);
        assert_eq!(timer.attempt(), 1);
        assert_eq!(timer.delay(), Duration::from_millis(1500));

        let mut fut = task::spawn(timer);
        assert_pending!(fut.poll());

        tokio::time::advance(Duration::from_millis(1499)).await;
        assert_pending!(fut.poll());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_ready!(fut.poll());
    }
}
