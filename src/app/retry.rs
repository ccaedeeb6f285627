//! Bounded exponential backoff for verifier calls.

use std::time::Duration;
use tokio::sync::watch;

/// Retry attempts per verifier call (so 4 calls total).
pub const MAX_RETRIES: u32 = 3;

/// Delay before re-attempting after attempt `n`: `base * 2^n`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.min(8))
}

/// Sleeps for `delay` unless shutdown wins. Returns `false` when the
/// sleep was interrupted and the caller should stop retrying. A dropped
/// shutdown sender just lets the sleep run to completion.
pub async fn sleep_unless_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => match changed {
                Ok(()) => {
                    if *shutdown.borrow() {
                        return false;
                    }
                }
                Err(_) => {
                    sleep.as_mut().await;
                    return true;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(20));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(40));
    }

    #[test]
    fn test_backoff_exponent_is_capped() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 100), Duration::from_secs(256));
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let sleeper = tokio::spawn(async move {
            sleep_unless_shutdown(Duration::from_secs(60), &mut rx).await
        });
        tx.send(true).unwrap();
        assert!(!sleeper.await.unwrap());
    }

    #[tokio::test]
    async fn test_sleep_completes_when_not_shut_down() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(sleep_unless_shutdown(Duration::from_millis(1), &mut rx).await);
    }

    #[tokio::test]
    async fn test_sleep_skipped_when_already_shut_down() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(!sleep_unless_shutdown(Duration::from_secs(60), &mut rx).await);
    }
}
