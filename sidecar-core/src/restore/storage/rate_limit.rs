use std::{fmt, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

/// Caps aggregate download bandwidth across every job and region.
///
/// Each acquisition reserves the next free slot of the byte budget and
/// waits until that slot starts, so concurrent callers are served in
/// arrival order without a refill task.
pub struct IngressRateLimiter {
    bytes_per_sec: u64,
    next_free: Mutex<Option<Instant>>,
}

impl fmt::Debug for IngressRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngressRateLimiter")
            .field("bytes_per_sec", &self.bytes_per_sec)
            .field("next_free", &*self.next_free.lock())
            .finish()
    }
}

impl IngressRateLimiter {
    /// `0` disables limiting.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            next_free: Mutex::new(None),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec == 0
    }

    /// Wait until `bytes` may be transferred.
    pub async fn acquire(&self, bytes: u64) {
        if self.is_unlimited() || bytes == 0 {
            return;
        }
        let start = self.reserve(bytes);
        if start > Instant::now() {
            tokio::time::sleep_until(start).await;
        }
    }

    fn reserve(&self, bytes: u64) -> Instant {
        let cost = Duration::from_secs_f64(bytes as f64 / self.bytes_per_sec as f64);
        let now = Instant::now();
        let mut next_free = self.next_free.lock();
        let start = next_free.map_or(now, |free| free.max(now));
        *next_free = Some(start + cost);
        start
    }
}
