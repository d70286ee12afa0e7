//! Test helper functions and utilities.

use std::future::Future;
use std::time::Duration;

/// Wait for a condition with timeout.
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Assert that a future completes within a timeout.
pub async fn assert_completes_within<F, T>(future: F, timeout: Duration) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .expect("Operation timed out")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_wait_for_immediate() {
        let result = wait_for(Duration::from_secs(1), Duration::from_millis(10), || async { true }).await;
        assert!(result);
    }

    #[tokio::test]
    async fn test_wait_for_eventually() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = wait_for(Duration::from_secs(1), Duration::from_millis(5), || {
            let calls = calls.clone();
            async move { calls.fetch_add(1, Ordering::SeqCst) >= 3 }
        })
        .await;
        assert!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_wait_for_timeout() {
        let result = wait_for(Duration::from_millis(50), Duration::from_millis(10), || async { false }).await;
        assert!(!result);
    }
}
