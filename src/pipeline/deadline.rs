//! Request deadline and bounded blocking calls

use std::time::Duration;
use tokio::time::Instant;

/// Absolute point after which the request must stop doing new work
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Timeout for one external call: its own limit, cut short by the deadline
    pub fn bound(&self, call_timeout: Duration) -> Duration {
        call_timeout.min(self.remaining())
    }
}

/// Why a bounded call produced no value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    TimedOut,
    Panicked(String),
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallFailure::TimedOut => write!(f, "timed out"),
            CallFailure::Panicked(msg) => write!(f, "worker failed: {}", msg),
        }
    }
}

/// Run a synchronous collaborator call on the blocking pool, giving up after `limit`
///
/// On timeout the worker is left to finish in the background; its result is
/// discarded.
pub async fn call_blocking<T, F>(limit: Duration, f: F) -> Result<T, CallFailure>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    if limit.is_zero() {
        return Err(CallFailure::TimedOut);
    }
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join_error)) => Err(CallFailure::Panicked(join_error.to_string())),
        Err(_) => Err(CallFailure::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_completes() {
        let value = call_blocking(Duration::from_secs(1), || 41 + 1).await;
        assert_eq!(value, Ok(42));
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let result = call_blocking(Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(300));
            1
        })
        .await;
        assert_eq!(result, Err(CallFailure::TimedOut));
    }

    #[tokio::test]
    async fn test_zero_budget_short_circuits() {
        let result = call_blocking(Duration::ZERO, || 1).await;
        assert_eq!(result, Err(CallFailure::TimedOut));
    }

    #[tokio::test]
    async fn test_deadline_bounds_call_timeout() {
        let deadline = Deadline::after(Duration::from_millis(50));
        assert!(deadline.bound(Duration::from_secs(5)) <= Duration::from_millis(50));
        assert!(!deadline.expired());

        let past = Deadline::after(Duration::ZERO);
        assert!(past.expired());
        assert_eq!(past.bound(Duration::from_secs(1)), Duration::ZERO);
    }
}
