//! Funnelgram - Telegram funnel progression engine and broadcast dispatcher
//!
//! This library drives automated bot interactions for a project: a
//! multi-step, delay-gated funnel advancing each subscriber through a
//! sequence of scheduled messages, and one-shot or scheduled broadcasts
//! fan-out delivered to a resolved audience snapshot.
//!
//! # Module Structure
//!
//! - `core`: configuration, errors, retry and rate limiting
//! - `storage`: SQLite persistence for steps, subscribers and broadcasts
//! - `delivery`: the transport adapter contract and its teloxide implementation
//! - `funnel`: the funnel progression engine
//! - `broadcast`: the broadcast dispatcher

pub mod broadcast;
pub mod cli;
pub mod core;
pub mod delivery;
pub mod funnel;
pub mod storage;

// Re-export commonly used types for convenience
pub use broadcast::BroadcastDispatcher;
pub use crate::core::{config, BotError, GlobalRateLimiter};
pub use delivery::{DeliveryAdapter, OutboundMessage, Recipient};
pub use funnel::FunnelEngine;
pub use storage::{create_pool, get_connection, DbConnection, DbPool};
