use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Token-bucket limiter for the transport's global outbound budget.
///
/// One instance is shared by every concurrent sender (funnel engine and
/// broadcast dispatcher alike); `acquire` blocks until a token is
/// available, so callers queue instead of tripping flood control.
#[derive(Clone)]
pub struct GlobalRateLimiter {
    state: Arc<Mutex<Bucket>>,
    capacity: u32,
    refill_interval: Duration,
}

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

impl GlobalRateLimiter {
    /// Limiter allowing `per_second` sustained sends with bursts up to
    /// `capacity`.
    pub fn new(per_second: u32, capacity: u32) -> Self {
        let per_second = per_second.max(1);
        Self {
            state: Arc::new(Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
            capacity: capacity.max(1),
            refill_interval: Duration::from_micros(1_000_000 / u64::from(per_second)),
        }
    }

    /// Wait for and consume one send token.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.state.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens > 0 {
                    bucket.tokens -= 1;
                    return;
                }
                self.refill_interval
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let elapsed = bucket.last_refill.elapsed();
        let earned = (elapsed.as_micros() / self.refill_interval.as_micros()) as u32;
        if earned > 0 {
            bucket.tokens = (bucket.tokens + earned).min(self.capacity);
            bucket.last_refill += self.refill_interval * earned;
        }
    }
}
