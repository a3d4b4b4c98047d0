// Rate limiting and bandwidth accounting.
//
// Limits are classic token buckets: capacity twice the configured rate, so
// a saturated second can be followed by one catch-up burst but no more.
// Refill is computed from elapsed time on access, which is equivalent to a
// fixed-tick refill at arbitrary tick granularity.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
// The tokio Instant honors the paused test clock, which the bucket tests
// rely on; it is a plain std Instant otherwise.
use tokio::time::Instant;
use serde::{Deserialize, Serialize};
use torq_core::speed_estimator::SpeedEstimator;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// None = unlimited.
    pub upload_bps: Option<NonZeroU32>,
    pub download_bps: Option<NonZeroU32>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    /// 0 = unlimited.
    rate: AtomicU64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: Option<NonZeroU32>) -> Self {
        Self {
            rate: AtomicU64::new(rate.map(|r| r.get() as u64).unwrap_or(0)),
            state: Mutex::new(BucketState {
                tokens: 0.,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn set_rate(&self, rate: Option<NonZeroU32>) {
        self.rate
            .store(rate.map(|r| r.get() as u64).unwrap_or(0), Ordering::Relaxed);
    }

    pub fn rate(&self) -> Option<NonZeroU32> {
        NonZeroU32::new(self.rate.load(Ordering::Relaxed) as u32)
    }

    fn refill(&self, state: &mut BucketState, rate: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.last_refill = now;
        state.tokens =
            (state.tokens + rate as f64 * elapsed.as_secs_f64()).min(rate as f64 * 2.);
    }

    /// Take `n` tokens if available right now.
    pub fn try_consume(&self, n: u64) -> bool {
        let rate = self.rate.load(Ordering::Relaxed);
        if rate == 0 {
            return true;
        }
        let mut g = self.state.lock();
        self.refill(&mut g, rate);
        if g.tokens >= n as f64 {
            g.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// Wait until `n` tokens are available and take them.
    pub async fn acquire(&self, n: u64) {
        loop {
            let rate = self.rate.load(Ordering::Relaxed);
            if rate == 0 {
                return;
            }
            let deficit = {
                let mut g = self.state.lock();
                self.refill(&mut g, rate);
                if g.tokens >= n as f64 {
                    g.tokens -= n as f64;
                    return;
                }
                n as f64 - g.tokens
            };
            let wait = Duration::from_secs_f64(deficit / rate as f64)
                .max(Duration::from_millis(10));
            tokio::time::sleep(wait).await;
        }
    }
}

/// One pair of buckets; the session holds a global one and each torrent its
/// own. A transfer must clear both.
pub struct Limits {
    pub up: TokenBucket,
    pub down: TokenBucket,
}

impl Limits {
    pub fn new(config: LimitsConfig) -> Self {
        Self {
            up: TokenBucket::new(config.upload_bps),
            down: TokenBucket::new(config.download_bps),
        }
    }

    pub fn set(&self, config: LimitsConfig) {
        self.up.set_rate(config.upload_bps);
        self.down.set_rate(config.download_bps);
    }

    pub fn config(&self) -> LimitsConfig {
        LimitsConfig {
            upload_bps: self.up.rate(),
            download_bps: self.down.rate(),
        }
    }
}

/// Byte counters plus smoothed speeds, one per torrent and one per session.
#[derive(Default)]
pub struct BandwidthTracker {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    pub up_speed: SpeedEstimator,
    pub down_speed: SpeedEstimator,
}

impl BandwidthTracker {
    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Called once a second from the owner's tick task.
    pub fn tick(&self) {
        self.up_speed.tick(self.uploaded());
        self.down_speed.tick(self.downloaded());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bps(n: u32) -> Option<NonZeroU32> {
        NonZeroU32::new(n)
    }

    #[test]
    fn test_unlimited_always_passes() {
        let bucket = TokenBucket::new(None);
        assert!(bucket.try_consume(u64::MAX));
    }

    #[test]
    fn test_empty_bucket_rejects() {
        // A fresh bucket has no tokens; consumption must wait for refill.
        let bucket = TokenBucket::new(bps(1000));
        assert!(!bucket.try_consume(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_rate_times_elapsed() {
        let bucket = TokenBucket::new(bps(1000));
        tokio::time::advance(Duration::from_millis(500)).await;
        // ~500 tokens accumulated after half a second.
        assert!(bucket.try_consume(400));
        assert!(!bucket.try_consume(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_at_twice_rate() {
        let bucket = TokenBucket::new(bps(1000));
        tokio::time::advance(Duration::from_secs(60)).await;
        // A minute of idling never buys more than 2x the per-second rate.
        assert!(bucket.try_consume(2000));
        assert!(!bucket.try_consume(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits() {
        let bucket = Arc::new(TokenBucket::new(bps(1000)));
        let started = tokio::time::Instant::now();
        let b = bucket.clone();
        let task = tokio::spawn(async move { b.acquire(1000).await });
        tokio::time::advance(Duration::from_millis(1100)).await;
        task.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[test]
    fn test_set_rate_to_unlimited() {
        let bucket = TokenBucket::new(bps(10));
        assert!(!bucket.try_consume(100));
        bucket.set_rate(None);
        assert!(bucket.try_consume(100));
    }
}
