//! Retry policy (spec §4.C): bounded retries with exponential backoff.
//!
//! A pure function, not a decorator capturing shared mutable state — the
//! original's decorator-based retry is non-thread-safe by its own
//! admission (spec §9); each call here gets fresh closures and owns its
//! own attempt counter.

use std::future::Future;
use std::time::Duration;

/// Runs `op`, retrying up to `attempts` times on failure with backoff
/// `backoff * 2^(attempt-1)` between tries. Calls `on_attempt_fail` with
/// each failure's error, and `on_exceeded` once after the final failed
/// attempt. Returns `op`'s `Ok` on success, or `on_exceeded`'s result if
/// every attempt fails.
pub async fn retry<Op, Fut, T, E, OnFail, OnExceeded, R>(
    mut op: Op,
    attempts: u32,
    backoff: Duration,
    mut on_attempt_fail: OnFail,
    on_exceeded: OnExceeded,
) -> R
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    OnFail: FnMut(&E),
    OnExceeded: FnOnce() -> R,
    R: From<T>,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return R::from(value),
            Err(err) => {
                on_attempt_fail(&err);
                if attempt < attempts {
                    let delay = backoff * 2u32.saturating_pow(attempt - 1);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    on_exceeded()
}

/// Default connection-factory retry budget (spec §4.B).
pub const DEFAULT_ATTEMPTS: u32 = 5;
/// Default connection-factory base backoff (spec §4.B).
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Wrapped(u32);
    impl From<u32> for Wrapped {
        fn from(v: u32) -> Self {
            Wrapped(v)
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_op_succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result: Wrapped = retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, &str>(7u32) }
            },
            3,
            Duration::from_millis(1),
            |_: &&str| {},
            || Wrapped(0),
        )
        .await;
        assert_eq!(result.0, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Wrapped = retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("fail")
                    } else {
                        Ok(42u32)
                    }
                }
            },
            5,
            Duration::from_millis(1),
            |_: &&str| {},
            || Wrapped(0),
        )
        .await;
        assert_eq!(result.0, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn calls_on_exceeded_after_final_failure() {
        let fail_count = AtomicU32::new(0);
        let result: Wrapped = retry(
            || async { Err::<u32, _>("always fails") },
            3,
            Duration::from_millis(1),
            |_: &&str| {
                fail_count.fetch_add(1, Ordering::SeqCst);
            },
            || Wrapped(999),
        )
        .await;
        assert_eq!(result.0, 999);
        assert_eq!(fail_count.load(Ordering::SeqCst), 3);
    }
}
