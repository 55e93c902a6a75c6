//! Token-bucket bandwidth limiting. Workers await tokens after each chunk
//! arrives so bytes already on the wire are accounted for instead of being
//! stalled mid-read.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Burst floor so a single 256 KiB read never has to drain in pieces.
const MIN_BURST: u64 = 256 * 1024;

struct BucketState {
    tokens: f64,
    updated: Instant,
}

struct Bucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

/// Byte-rate limiter. A rate of zero disables limiting and turns `wait` into
/// a no-op.
pub struct RateLimiter {
    bucket: Option<Bucket>,
}

impl RateLimiter {
    pub fn new(rate: u64) -> Self {
        if rate == 0 {
            return Self { bucket: None };
        }
        let burst = rate.max(MIN_BURST) as f64;
        Self {
            bucket: Some(Bucket {
                rate: rate as f64,
                burst,
                state: Mutex::new(BucketState {
                    tokens: burst,
                    updated: Instant::now(),
                }),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bucket.is_some()
    }

    /// Blocks until `n` tokens are available. Dropping the future (e.g. when
    /// a cancel arm wins a select) releases nothing it has not yet taken.
    pub async fn wait(&self, n: usize) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        let need = (n as f64).min(bucket.burst);
        loop {
            let sleep_for = {
                let mut state = bucket
                    .state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let now = Instant::now();
                let elapsed = now.duration_since(state.updated).as_secs_f64();
                state.tokens = (state.tokens + elapsed * bucket.rate).min(bucket.burst);
                state.updated = now;
                if state.tokens >= need {
                    state.tokens -= need;
                    return;
                }
                Duration::from_secs_f64((need - state.tokens) / bucket.rate)
            };
            tokio::time::sleep(sleep_for).await;
        }
    }
}
