use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::Classify;

/// Run `op`, retrying retryable failures up to `retries` extra times with a
/// fixed pause. Anything still failing is handed back to the caller.
pub async fn with_local_retries<T, E, F, Fut>(
    operation: &str,
    retries: u32,
    pause: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let mut retried = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && retried < retries => {
                retried += 1;
                warn!(operation, retry = retried, error = %err, "transient failure, retrying");
                tokio::time::sleep(pause).await;
            }
            Err(err) => return Err(err),
        }
    }
}
