//! Polling helpers for asynchronous assertions.

use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// passes. Returns whether it held.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(5)).await;
    }
}

/// Let spawned tasks run for `duration`, for asserting that something
/// does not happen
pub async fn settle(duration: Duration) {
    sleep(duration).await;
}
