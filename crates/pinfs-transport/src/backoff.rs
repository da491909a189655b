//! Exponential backoff for rate-limited chat RPCs.
//!
//! Only `RateLimited` is retried; every other error surfaces immediately.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::TransportError;

const MAX_RETRIES: u32 = 5;
const INITIAL_DELAY: Duration = Duration::from_millis(250);

/// Run `op`, retrying rate-limit rejections with doubling delays.
pub async fn with_backoff<T, F, Fut>(label: &str, mut op: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut delay = INITIAL_DELAY;
    let mut attempt = 0u32;

    loop {
        match op().await {
            Err(TransportError::RateLimited) if attempt < MAX_RETRIES => {
                attempt += 1;
                warn!(label, attempt, delay_ms = delay.as_millis() as u64, "rate limited");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
}
