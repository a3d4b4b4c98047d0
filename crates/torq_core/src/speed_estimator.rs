use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

const EWMA_ALPHA: f64 = 0.2;
const SAMPLE_WINDOW: usize = 60;

/// Tracks a transfer rate from a monotonically growing byte counter.
///
/// `tick()` is called once a second with the current counter value; the
/// exponentially weighted rate smooths bursts, and the last 60 per-second
/// samples are kept for rate graphs.
pub struct SpeedEstimator {
    state: Mutex<State>,
    bytes_per_second: AtomicU64,
}

struct State {
    last_total: Option<u64>,
    rate: f64,
    samples: VecDeque<u64>,
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedEstimator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                last_total: None,
                rate: 0.,
                samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            }),
            bytes_per_second: AtomicU64::new(0),
        }
    }

    pub fn tick(&self, total_bytes: u64) {
        let mut g = self.state.lock();
        let delta = match g.last_total {
            Some(last) => total_bytes.saturating_sub(last),
            None => 0,
        };
        g.last_total = Some(total_bytes);
        g.rate = EWMA_ALPHA * delta as f64 + (1. - EWMA_ALPHA) * g.rate;
        if g.samples.len() == SAMPLE_WINDOW {
            g.samples.pop_front();
        }
        g.samples.push_back(delta);
        self.bytes_per_second.store(g.rate as u64, Ordering::Relaxed);
    }

    pub fn bps(&self) -> u64 {
        self.bytes_per_second.load(Ordering::Relaxed)
    }

    pub fn samples(&self) -> Vec<u64> {
        self.state.lock().samples.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ewma_converges() {
        let est = SpeedEstimator::new();
        let mut total = 0u64;
        est.tick(total);
        for _ in 0..100 {
            total += 1000;
            est.tick(total);
        }
        // After enough steady ticks the EWMA settles on the true rate.
        let bps = est.bps();
        assert!((990..=1000).contains(&bps), "bps={bps}");
    }

    #[test]
    fn test_first_tick_is_baseline() {
        let est = SpeedEstimator::new();
        est.tick(1_000_000);
        // The first observation establishes the baseline, not a burst.
        assert_eq!(est.bps(), 0);
    }

    #[test]
    fn test_sample_window_caps_at_60() {
        let est = SpeedEstimator::new();
        for i in 0..100u64 {
            est.tick(i * 10);
        }
        let samples = est.samples();
        assert_eq!(samples.len(), 60);
        assert!(samples.iter().skip(1).all(|&s| s == 10));
    }
}
