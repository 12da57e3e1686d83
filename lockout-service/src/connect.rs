//! Startup connection retries shared by the Redis, Postgres and NATS bootstraps

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Run `connect` until it succeeds or `max_retries` retries have failed
///
/// Waits `base_delay * 2^(n-1)` before the n-th retry.
pub(crate) async fn with_retries<T, F, Fut>(
    dependency: &str,
    max_retries: u32,
    base_delay: Duration,
    mut connect: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;

    loop {
        match connect().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(
                        "{} connection established after {} attempt(s)",
                        dependency,
                        attempt + 1
                    );
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;

                if attempt > max_retries {
                    tracing::error!(
                        "Failed to connect to {} after {} attempts: {}",
                        dependency,
                        max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = base_delay.saturating_mul(2_u32.saturating_pow(attempt - 1));
                tracing::warn!(
                    "{} connection attempt {} failed: {}. Retrying in {:?}...",
                    dependency,
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let value = with_retries("test", 3, Duration::from_millis(1), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Internal("not yet".to_string()))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries("test", 2, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Internal("down".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
