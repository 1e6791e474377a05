use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A per-provider token bucket (spec §5: "Embeddings and LLM calls are
/// rate-limited per provider via a token bucket sized from configuration;
/// excess traffic fails with `PROVIDER_BUSY`"). No rate limiter exists
/// anywhere in the originating codebase to ground this on; it follows the
/// same `Arc<Mutex<_>>` + manual-refill idiom the storage crate's WAL uses
/// for its LSN counter.
pub struct RateLimiter {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn per_minute(limit_per_minute: u32) -> Self {
        let capacity = limit_per_minute.max(1) as f64;
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_per_sec: capacity / 60.0,
        }
    }

    /// Attempts to take one token. Returns `true` if the caller may proceed;
    /// `false` means the caller should fail the request with
    /// `PROVIDER_BUSY`.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
