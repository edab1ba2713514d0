use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio::time::sleep;

/// Bounded retry with linear backoff: attempt `n` (1-based) that comes up
/// empty is followed by a sleep of `n * step`. No sleep follows the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            step: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, step: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            step,
        }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.step.checked_mul(attempt).unwrap_or(Duration::MAX)
    }

    /// Run `op` until it yields `Some`, or the attempts are used up.
    ///
    /// `op` receives the 1-based attempt number. Dropping the returned future
    /// cancels the loop, including any pending backoff sleep.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        for attempt in 1..=self.attempts {
            if let Some(found) = op(attempt).await {
                return Some(found);
            }
            if attempt < self.attempts {
                let delay = self.delay_after(attempt);
                debug!("{label}: attempt {attempt}/{} empty, retrying in {delay:?}", self.attempts);
                sleep(delay).await;
            }
        }
        None
    }
}
