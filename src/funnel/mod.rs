//! Funnel progression: per-subscriber timed step advancement

pub mod engine;

pub use engine::{FunnelEngine, PassStats};
