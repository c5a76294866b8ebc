//! Client-side retry backoff schedule (spec §4.11 step 5).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetrySchedule {
    delays_ms: Vec<u64>,
}

impl RetrySchedule {
    pub fn new(delays_ms: Vec<u64>) -> Self {
        Self { delays_ms }
    }

    pub fn attempts(&self) -> impl Iterator<Item = Duration> + '_ {
        self.delays_ms.iter().map(|ms| Duration::from_millis(*ms))
    }
}
