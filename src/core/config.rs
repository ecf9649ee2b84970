use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

/// Configuration constants for the engines

/// Path to the SQLite database file
/// Read once at startup from FUNNELGRAM_DB environment variable
pub static DATABASE_PATH: Lazy<String> =
    Lazy::new(|| env::var("FUNNELGRAM_DB").unwrap_or_else(|_| "funnelgram.sqlite".to_string()));

/// Funnel progression engine configuration
pub mod funnel {
    use super::Duration;

    /// Interval between scheduling passes (in seconds)
    pub const TICK_INTERVAL_SECS: u64 = 5;

    /// Maximum number of subscribers evaluated concurrently per pass
    pub const MAX_PARALLEL_EVALUATIONS: usize = 16;

    /// Scheduling tick interval duration
    pub fn tick_interval() -> Duration {
        Duration::from_secs(TICK_INTERVAL_SECS)
    }
}

/// Broadcast dispatcher configuration
pub mod broadcast {
    use super::Duration;

    /// Interval between dispatcher ticks (in seconds)
    pub const TICK_INTERVAL_SECS: u64 = 5;

    /// Maximum number of recipients processed concurrently per run
    pub const MAX_PARALLEL_SENDS: usize = 8;

    /// Maximum number of broadcasts run concurrently per tick
    pub const MAX_PARALLEL_RUNS: usize = 4;

    /// Dispatcher tick interval duration
    pub fn tick_interval() -> Duration {
        Duration::from_secs(TICK_INTERVAL_SECS)
    }
}

/// Outbound rate limiting configuration
///
/// One global budget shared by all concurrent senders — the transport
/// enforces its limit per bot process, not per chat.
pub mod rate_limit {
    /// Sustained outbound messages per second
    pub const MESSAGES_PER_SECOND: u32 = 25;

    /// Burst capacity of the token bucket
    pub const BURST_CAPACITY: u32 = 25;
}

/// Delivery retry configuration (transient transport errors only)
pub mod delivery {
    use super::Duration;

    /// Maximum delivery attempts per send, including the first
    pub const MAX_ATTEMPTS: u32 = 3;

    /// Initial backoff before the second attempt (in milliseconds)
    pub const INITIAL_BACKOFF_MS: u64 = 500;

    /// Initial backoff duration
    pub fn initial_backoff() -> Duration {
        Duration::from_millis(INITIAL_BACKOFF_MS)
    }
}
