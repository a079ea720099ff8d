//! Local retry of throttled inference calls.
//!
//! ## Two tiers
//!
//! Short throttling bursts are absorbed here with exponential backoff:
//! `min(base · 2^(attempt-1), max)` plus uniform jitter in
//! `[0, jitter_ratio · backoff]`, so hundreds of page workers throttled at the
//! same moment do not retry in lockstep. When the attempts run out the caller
//! gets [`RetryError::Exhausted`] and escalates, leaving sustained throttling
//! to the queue's slower redelivery.
//!
//! Anything that is not a throttling signal is returned immediately as
//! [`RetryError::Fatal`]; retrying a deterministic rejection only burns quota.

use crate::error::{InferenceError, PipelineError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Ceiling on the backoff before jitter is added.
    pub max_delay_ms: u64,
    /// Jitter upper bound as a fraction of the backoff.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ratio: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_attempts == 0 {
            return Err(PipelineError::InvalidConfig(
                "Retry max_attempts must be ≥ 1".into(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(PipelineError::InvalidConfig(format!(
                "Retry base backoff {}ms exceeds max backoff {}ms",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(PipelineError::InvalidConfig(format!(
                "Jitter ratio must be 0–1, got {}",
                self.jitter_ratio
            )));
        }
        Ok(())
    }

    /// Backoff before jitter for the retry following failed `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Backoff plus uniform jitter in `[0, jitter_ratio · backoff]`.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let span = backoff.as_millis() as f64 * self.jitter_ratio;
        let jitter = if span > 0.0 {
            rand::thread_rng().gen_range(0.0..=span)
        } else {
            0.0
        };
        backoff + Duration::from_millis(jitter.round() as u64)
    }

    /// Delay to wait after failed `attempt`. A provider `retry-after` hint
    /// replaces the computed backoff but is still capped at the ceiling.
    pub fn delay(&self, attempt: u32, retry_after_ms: Option<u64>) -> Duration {
        match retry_after_ms {
            Some(ms) => Duration::from_millis(ms.min(self.max_delay_ms)),
            None => self.jittered(attempt),
        }
    }

    /// Largest delay [`Self::delay`] can return.
    pub fn max_delay(&self) -> Duration {
        let max = self.max_delay_ms as f64 * (1.0 + self.jitter_ratio);
        Duration::from_millis(max.ceil() as u64)
    }
}

/// Why [`with_backoff`] gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError {
    /// Every attempt was throttled.
    Exhausted { attempts: u32, last: InferenceError },
    /// A non-throttling failure, returned without retrying.
    Fatal { attempt: u32, error: InferenceError },
}

/// Run `call` until it succeeds, fails with something other than
/// throttling, or `policy.max_attempts` throttled attempts have been made.
///
/// `on_retry(attempt, delay)` fires before each sleep. Returns the value and
/// the number of attempts it took.
pub async fn with_backoff<T, F, Fut, R>(
    policy: &RetryPolicy,
    mut call: F,
    mut on_retry: R,
) -> Result<(T, u32), RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, InferenceError>>,
    R: FnMut(u32, Duration),
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match call(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("inference succeeded on attempt {}", attempt);
                }
                return Ok((value, attempt));
            }
            Err(InferenceError::Throttled {
                detail,
                retry_after_ms,
            }) => {
                let last = InferenceError::Throttled {
                    detail,
                    retry_after_ms,
                };
                if attempt >= max {
                    warn!("throttled on all {} attempts, escalating", attempt);
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last,
                    });
                }
                let delay = policy.delay(attempt, retry_after_ms);
                warn!("throttled (attempt {}/{}), retrying in {:?}", attempt, max, delay);
                on_retry(attempt, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(RetryError::Fatal { attempt, error }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn throttled() -> InferenceError {
        InferenceError::Throttled {
            detail: "429".into(),
            retry_after_ms: None,
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = RetryPolicy::default();
        let steps: Vec<u64> = (1..=7).map(|a| p.backoff(a).as_millis() as u64).collect();
        assert_eq!(steps, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
        assert!(steps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn backoff_survives_huge_attempt_numbers() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_stays_within_half_the_backoff() {
        let p = RetryPolicy::default();
        for attempt in 1..=8 {
            let base = p.backoff(attempt);
            for _ in 0..50 {
                let d = p.jittered(attempt);
                assert!(d >= base);
                assert!(d <= base + base / 2 + Duration::from_millis(1));
                assert!(d <= p.max_delay());
            }
        }
    }

    #[test]
    fn retry_after_is_capped() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(1, Some(120_000)), Duration::from_millis(30_000));
        assert_eq!(p.delay(1, Some(500)), Duration::from_millis(500));
    }

    #[test]
    fn validation_rejects_inverted_bounds() {
        let p = RetryPolicy {
            base_delay_ms: 10,
            max_delay_ms: 5,
            ..RetryPolicy::default()
        };
        assert!(p.validate().unwrap_err().to_string().contains("backoff"));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_fifth_attempt_after_four_throttles() {
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();
        let (value, attempts) = with_backoff(
            &RetryPolicy::default(),
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 5 {
                        Err(throttled())
                    } else {
                        Ok("done")
                    }
                }
            },
            |attempt, _| retries.push(attempt),
        )
        .await
        .unwrap();
        assert_eq!(value, "done");
        assert_eq!(attempts, 5);
        assert_eq!(retries, vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = with_backoff(
            &RetryPolicy::default(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(throttled()) }
            },
            |_, _| {},
        )
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(matches!(err, RetryError::Exhausted { attempts: 5, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = with_backoff(
            &RetryPolicy::default(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(InferenceError::Rejected("bad image".into())) }
            },
            |_, _| {},
        )
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::Fatal { attempt: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_follow_the_schedule() {
        let policy = RetryPolicy {
            jitter_ratio: 0.0,
            ..RetryPolicy::default()
        };
        let start = tokio::time::Instant::now();
        let _ = with_backoff(&policy, |_| async { Err::<(), _>(throttled()) }, |_, _| {}).await;
        // 1 + 2 + 4 + 8 seconds between five attempts.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(15), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(16), "{elapsed:?}");
    }
}
