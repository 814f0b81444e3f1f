use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Run `op`, and if it fails, run it exactly once more after `backoff`.
///
/// Only for infrastructure faults. Outcomes of user code are never retried.
pub async fn retry_once<T, E, F, Fut>(operation: &str, backoff: Duration, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_once_if(operation, backoff, |_| true, op).await
}

/// Like [`retry_once`], but only errors accepted by `retryable` get the
/// second attempt. Anything else is returned as is.
pub async fn retry_once_if<T, E, P, F, Fut>(operation: &str, backoff: Duration, retryable: P, mut op: F) -> Result<T, E>
where
    P: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(e) if retryable(&e) => {
            warn!(operation, error = %e, backoff_ms = backoff.as_millis() as u64, "Transient failure, retrying once");
            tokio::time::sleep(backoff).await;
            op().await
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_success_runs_once() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<u32, String> = retry_once("op", Duration::ZERO, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_on_second_attempt() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<u32, String> = retry_once("op", Duration::from_millis(1), || async move {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err("flaky".to_string()),
                _ => Ok(1),
            }
        })
        .await;
        assert_eq!(result, Ok(1));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_two_attempts() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<u32, String> = retry_once("op", Duration::ZERO, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down".to_string())
        })
        .await;
        assert_eq!(result, Err("down".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_runs_once() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<u32, String> = retry_once_if(
            "op",
            Duration::ZERO,
            |e: &String| e.starts_with("transient"),
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            },
        )
        .await;
        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
