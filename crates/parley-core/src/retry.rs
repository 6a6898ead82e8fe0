use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Retry an idempotent read with exponential backoff while the error is
/// transient. Writes must never go through here.
pub async fn retry_read<F, Fut, T>(what: &str, max_retries: usize, base_delay_ms: u64, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = base_delay_ms.saturating_mul(1u64 << attempt.min(6));
                tracing::warn!(
                    what,
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay,
                    error = %e,
                    "transient read error, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
