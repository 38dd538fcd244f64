//! Bounded-retry observation of eventually consistent state.
//!
//! Delivery across a node is asynchronous: a publish returns before any
//! subscriber has seen the data. Callers that need to observe the effect poll
//! for it with a bounded number of attempts instead of assuming it is
//! immediate.

use std::time::Duration;

/// How often and how long to re-check a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// Maximum number of checks
    pub attempts: u32,
    /// Pause between checks
    pub delay: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: 50,
            delay: Duration::from_millis(20),
        }
    }
}

impl Retry {
    /// Retry policy with explicit bounds
    #[must_use]
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Check until `check` returns true; false when every attempt failed
    pub async fn until<F>(&self, mut check: F) -> bool
    where
        F: FnMut() -> bool,
    {
        self.until_some(|| check().then_some(())).await.is_some()
    }

    /// Check until `check` yields a value
    pub async fn until_some<T, F>(&self, mut check: F) -> Option<T>
    where
        F: FnMut() -> Option<T>,
    {
        for attempt in 0..self.attempts.max(1) {
            if let Some(value) = check() {
                return Some(value);
            }
            if attempt + 1 < self.attempts {
                tokio::time::sleep(self.delay).await;
            }
        }
        None
    }

    /// Whether `check` stays true on every attempt. Used to assert that
    /// something does not happen.
    pub async fn holds<F>(&self, mut check: F) -> bool
    where
        F: FnMut() -> bool,
    {
        for attempt in 0..self.attempts.max(1) {
            if !check() {
                return false;
            }
            if attempt + 1 < self.attempts {
                tokio::time::sleep(self.delay).await;
            }
        }
        true
    }
}

/// [`Retry::until`] with the default bounds
pub async fn retry_until<F>(check: F) -> bool
where
    F: FnMut() -> bool,
{
    Retry::default().until(check).await
}

/// [`Retry::until_some`] with the default bounds
pub async fn eventually<T, F>(check: F) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    Retry::default().until_some(check).await
}
