use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Doubling delay between `min` and `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    cur: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { cur: min, min, max }
    }

    pub fn reset(&mut self) {
        self.cur = self.min;
    }

    pub fn next_delay(&mut self) -> Duration {
        let d = self.cur;
        self.cur = std::cmp::min(self.cur * 2, self.max);
        d
    }
}

/// Sleeps for `d` unless cancelled first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = sleep(d) => true,
        _ = cancel.cancelled() => false,
    }
}
