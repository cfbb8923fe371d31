use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Every attempt failed
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Run `op` up to `max_attempts` times, stopping at the first success.
///
/// `op` receives the 1-based attempt number. Failed attempts are followed by
/// `delay`, except the last one. The sleep only suspends the calling task.
/// A `max_attempts` of zero is treated as one.
///
/// Returns the successful value together with the attempt that produced it.
pub async fn run_with_retry<T, E, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    mut op: F,
) -> Result<(T, u32), RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(attempt, "Succeeded after retry");
                }
                return Ok((value, attempt));
            }
            Err(e) if attempt >= max_attempts => {
                warn!(attempt, max_attempts, error = %e, "Giving up after final attempt");
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: e,
                });
            }
            Err(e) => {
                warn!(attempt, max_attempts, error = %e, "Attempt failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    #[tokio::test]
    async fn test_always_failing_stops_at_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<((), u32), _> =
            run_with_retry(4, Duration::from_millis(1), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("failure {}", attempt)) }
            })
            .await;

        let exhausted = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(exhausted.attempts, 4);
        assert_eq!(exhausted.last_error, "failure 4");
    }

    #[tokio::test]
    async fn test_short_circuits_on_success() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(3, Duration::from_millis(1), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err("not yet")
                } else {
                    Ok("converted")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), ("converted", 3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_first_success_makes_one_call() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(3, Duration::from_secs(60), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(()) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_delay_after_final_attempt() {
        let start = Instant::now();
        let result: Result<((), u32), _> =
            run_with_retry(1, Duration::from_secs(60), |_| async { Err("nope") }).await;
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_delay_between_attempts() {
        let start = Instant::now();
        let _: Result<((), u32), _> =
            run_with_retry(3, Duration::from_millis(50), |_| async { Err("nope") }).await;
        // two gaps for three attempts
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_zero_attempts_runs_once() {
        let calls = AtomicU32::new(0);
        let _: Result<((), u32), _> = run_with_retry(0, Duration::from_millis(1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope") }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
