//! Core utilities: configuration, errors, retry and rate limiting

pub mod config;
pub mod errors;
pub mod rate_limiter;
pub mod retry;

pub use errors::BotError;
pub use rate_limiter::GlobalRateLimiter;
