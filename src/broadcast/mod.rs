//! Broadcast fan-out: audience snapshots and resumable delivery runs

pub mod dispatcher;

pub use dispatcher::{BroadcastDispatcher, RunSummary};
