use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket rate limiter. `take()` blocks cooperatively, polling every
/// ~50ms, until a token is available.
pub struct TokenBucket {
    rps_max: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

impl TokenBucket {
    pub fn new(rps_max: f64, burst: Option<f64>) -> Self {
        let burst = burst.unwrap_or(rps_max).max(1.0);
        Self {
            rps_max,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    fn try_take(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rps_max).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Block until a token is available, then consume it.
    pub async fn take(&self) {
        loop {
            if self.try_take() {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
