//! Exponential-backoff retry for safe-to-fail tasks (spec.md §4.2).
//!
//! Generalized from the teacher's `resilience/retry.rs` `retry_with_backoff`:
//! same three-attempt, doubling-delay shape, parameterized here to the
//! spec's fixed 100/200/400 ms ladder rather than the teacher's configurable
//! multiplier, since the spec pins the exact schedule.

use std::time::Duration;

/// Fixed retry ladder for `sandboxed_code` tasks with `side_effects == false`
/// (spec.md §4.2: "up to three attempts with exponential backoff (100 ms,
/// 200 ms, 400 ms)").
pub const MAX_ATTEMPTS: u32 = 3;
const DELAYS_MS: [u64; 3] = [100, 200, 400];

/// Run `attempt` up to [`MAX_ATTEMPTS`] times, sleeping the fixed backoff
/// ladder between failures. Returns the last error if every attempt fails.
pub async fn retry_with_backoff<F, Fut, T, E>(mut attempt: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    for (index, delay_ms) in DELAYS_MS.iter().enumerate() {
        match attempt(index as u32).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if index + 1 == DELAYS_MS.len() {
                    return Err(err);
                }
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            }
        }
    }
    unreachable!("DELAYS_MS is non-empty, so the loop above always returns")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn succeeds_without_retry_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_with_backoff(|_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_all_attempts_on_persistent_failure() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_with_backoff(|_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom") }
        })
        .await;
        assert_eq!(result, Err("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }
}
