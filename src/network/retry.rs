use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};


/// Fixed-backoff retry budget for outgoing connects
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Runs `attempt` until it succeeds or the retries are used up, sleeping `backoff` in between.
    ///  The attempt number (starting at 0) is passed in. The last error is returned when all
    ///  attempts failed.
    pub async fn run<T, F, Fut>(&self, what: &str, mut attempt: F) -> anyhow::Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut n = 0;
        loop {
            match attempt(n).await {
                Ok(result) => return Ok(result),
                Err(e) if n < self.retries => {
                    debug!("{} failed (attempt {} of {}): {} - retrying in {:?}", what, n + 1, self.retries + 1, e, self.backoff);
                    tokio::time::sleep(self.backoff).await;
                    n += 1;
                }
                Err(e) => {
                    warn!("{} failed after {} attempts: {}", what, n + 1, e);
                    return Err(e);
                }
            }
        }
    }
}
