//! Async test helpers

use crate::core_sync::SyncStatus;
use std::future::Future;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

/// Helper to assert a future completes within duration
pub async fn assert_completes_within<F, T>(duration: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => panic!("Future did not complete within {:?}", duration),
    }
}

/// Wait until a published status satisfies `predicate`
pub async fn wait_for_status<P>(
    rx: &mut watch::Receiver<SyncStatus>,
    duration: Duration,
    predicate: P,
) -> SyncStatus
where
    P: Fn(&SyncStatus) -> bool,
{
    assert_completes_within(duration, async {
        loop {
            {
                let status = rx.borrow_and_update();
                if predicate(&status) {
                    return status.clone();
                }
            }
            rx.changed().await.expect("status sender dropped");
        }
    })
    .await
}

/// Poll `condition` every few milliseconds until it holds
pub async fn eventually<F>(duration: Duration, condition: F)
where
    F: Fn() -> bool,
{
    assert_completes_within(duration, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_assert_completes_within_success() {
        let result = assert_completes_within(Duration::from_secs(1), async { 42 }).await;
        assert_eq!(result, 42);
    }

    #[tokio::test]
    #[should_panic(expected = "did not complete")]
    async fn test_assert_completes_within_timeout() {
        assert_completes_within(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;
    }

    #[tokio::test]
    async fn test_wait_for_status() {
        let (tx, mut rx) = watch::channel(SyncStatus::default());
        tokio::spawn(async move {
            tx.send_modify(|s| s.pending_count = 3);
            tokio::time::sleep(Duration::from_millis(50)).await;
        });
        let status = wait_for_status(&mut rx, Duration::from_secs(1), |s| s.pending_count == 3).await;
        assert_eq!(status.pending_count, 3);
    }
}
