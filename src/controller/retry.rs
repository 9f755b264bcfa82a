//! Fixed-interval retry bounded by a wall-clock deadline

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::error::{Error, Result};

/// Interval used by the delete graph's cleanup tasks
pub const CLEANUP_RETRY_INTERVAL: Duration = Duration::from_secs(10);
/// Ceiling used by the delete graph's cleanup tasks
pub const CLEANUP_RETRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Run `f` until it succeeds, sleeping `interval` between attempts.
///
/// Gives up with [`Error::Timeout`] carrying the last error once another
/// attempt would start after `timeout`.
pub async fn retry_until_timeout<T, F, Fut>(
    task: &str,
    interval: Duration,
    timeout: Duration,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if Instant::now() + interval > deadline {
                    return Err(Error::Timeout(format!(
                        "{task} did not succeed within {timeout:?} after {attempt} attempts: {err}"
                    )));
                }
                warn!(task, attempt, error = %err, "Retrying in {:?}", interval);
                sleep(interval).await;
            }
        }
    }
}
