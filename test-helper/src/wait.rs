use std::time::Duration;

use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls `condition` until it returns `true` or `timeout` elapses.
pub async fn wait_for(
    timeout: Duration,
    mut condition: impl FnMut() -> bool,
) -> anyhow::Result<()> {
    let expires_at = Instant::now() + timeout;
    loop {
        if condition() {
            return Ok(());
        }

        if Instant::now() >= expires_at {
            anyhow::bail!("Condition was not met within {timeout:?}");
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_wait_for_condition() {
        let polls = AtomicUsize::new(0);
        wait_for(Duration::from_secs(1), || polls.fetch_add(1, Ordering::Relaxed) >= 3)
            .await
            .expect("Condition should be met.");
    }

    #[tokio::test]
    async fn test_wait_for_timeout() {
        let res = wait_for(Duration::from_millis(20), || false).await;
        assert!(res.is_err());
    }
}
