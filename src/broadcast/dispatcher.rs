//! Background dispatcher that runs broadcasts to completion.
//!
//! Each tick claims scheduled broadcasts whose time has come and picks
//! up any broadcast stuck in `sending` (a crashed run). A run snapshots
//! its audience into the per-recipient ledger exactly once, then works
//! through the `pending` rows with bounded parallelism. Outcomes are
//! written with a pending-only conditional update, so a resumed run can
//! never re-send to a recipient that was already settled.

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::core::config;
use crate::core::errors::BotError;
use crate::delivery::{DeliveryAdapter, OutboundMessage, Recipient};
use crate::storage::db::{self, Broadcast, BroadcastStatus, DbPool};
use crate::storage::get_connection;

/// Ledger tallies after a finished run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub sent: u32,
    pub failed: u32,
}

pub struct BroadcastDispatcher {
    db_pool: Arc<DbPool>,
    adapter: Arc<dyn DeliveryAdapter>,
    max_parallel: usize,
}

impl BroadcastDispatcher {
    pub fn new(db_pool: Arc<DbPool>, adapter: Arc<dyn DeliveryAdapter>) -> Arc<Self> {
        Arc::new(Self {
            db_pool,
            adapter,
            max_parallel: config::broadcast::MAX_PARALLEL_SENDS,
        })
    }

    /// Start the periodic dispatcher loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(config::broadcast::tick_interval());
            log::info!(
                "Broadcast dispatcher started (interval: {}s)",
                config::broadcast::TICK_INTERVAL_SECS
            );

            loop {
                ticker.tick().await;
                if let Err(e) = dispatcher.tick().await {
                    log::error!("Broadcast dispatcher tick failed: {e}");
                }
            }
        })
    }

    /// One dispatcher tick at the current wall clock.
    pub async fn tick(&self) -> Result<(), BotError> {
        self.tick_at(Utc::now().timestamp()).await
    }

    /// Claim due scheduled broadcasts and run everything in `sending`
    /// (freshly claimed or left over from a crash).
    pub async fn tick_at(&self, now: i64) -> Result<(), BotError> {
        let to_run = {
            let conn = get_connection(&self.db_pool)?;
            let claimed = db::claim_due_scheduled(&conn, now)?;
            if !claimed.is_empty() {
                log::info!("Activated {} scheduled broadcast(s)", claimed.len());
            }
            db::sending_broadcast_ids(&conn)?
        };

        // Runs proceed in parallel; a long fan-out must not stall the
        // other broadcasts or later scheduled activations. The shared
        // rate limiter is the only cross-run contention point.
        stream::iter(to_run)
            .for_each_concurrent(config::broadcast::MAX_PARALLEL_RUNS, |broadcast_id| async move {
                match self.run_broadcast(broadcast_id, now).await {
                    Ok(summary) => {
                        log::info!(
                            "Broadcast {broadcast_id} completed: {} sent, {} failed",
                            summary.sent,
                            summary.failed
                        );
                    }
                    Err(e) => log::error!("Broadcast {broadcast_id} run failed: {e}"),
                }
            })
            .await;
        Ok(())
    }

    /// Run one `sending` broadcast to a terminal state.
    pub async fn run_broadcast(&self, broadcast_id: i64, now: i64) -> Result<RunSummary, BotError> {
        let broadcast = {
            let conn = get_connection(&self.db_pool)?;
            let broadcast = db::get_broadcast(&conn, broadcast_id)?
                .ok_or_else(|| BotError::Validation(format!("no such broadcast {broadcast_id}")))?;
            if broadcast.status != BroadcastStatus::Sending {
                return Err(BotError::Validation(format!(
                    "broadcast {broadcast_id} is not sending (status: {})",
                    broadcast.status
                )));
            }

            // The project row carries the transport credentials; without
            // it the run can never finish — that is the one genuine
            // `failed` path.
            if db::get_project(&conn, broadcast.project_id)?.is_none() {
                db::fail_broadcast(&conn, broadcast_id)?;
                return Err(BotError::Validation(format!(
                    "project {} for broadcast {broadcast_id} is gone",
                    broadcast.project_id
                )));
            }

            let audience = db::snapshot_audience(&conn, &broadcast)?;
            log::info!("Broadcast {broadcast_id}: audience of {audience} recipient(s)");
            broadcast
        };

        let pending = {
            let conn = get_connection(&self.db_pool)?;
            db::pending_recipients(&conn, broadcast_id)?
        };
        let message = render_broadcast(&broadcast);

        stream::iter(pending)
            .for_each_concurrent(self.max_parallel, |recipient| {
                let message = &message;
                let broadcast = &broadcast;
                async move {
                    let to = Recipient {
                        project_id: broadcast.project_id,
                        chat_id: recipient.chat_id,
                    };
                    match self.adapter.send(&to, message).await {
                        Ok(_) => {
                            match get_connection(&self.db_pool) {
                                Ok(mut conn) => {
                                    if let Err(e) = db::mark_recipient_sent(
                                        &mut conn,
                                        broadcast_id,
                                        recipient.subscriber_id,
                                        now,
                                    ) {
                                        log::error!(
                                            "Failed to record sent outcome for subscriber {}: {e}",
                                            recipient.subscriber_id
                                        );
                                    }
                                }
                                Err(e) => log::error!("DB pool exhausted recording outcome: {e}"),
                            };
                        }
                        Err(err) => {
                            // Failed recipients are recorded and skipped,
                            // never retried within the run.
                            log::warn!(
                                "Broadcast {broadcast_id}: delivery to chat {} failed: {err}",
                                recipient.chat_id
                            );
                            match get_connection(&self.db_pool) {
                                Ok(conn) => {
                                    if let Err(e) = db::mark_recipient_failed(
                                        &conn,
                                        broadcast_id,
                                        recipient.subscriber_id,
                                        now,
                                    ) {
                                        log::error!(
                                            "Failed to record failed outcome for subscriber {}: {e}",
                                            recipient.subscriber_id
                                        );
                                    }
                                }
                                Err(e) => log::error!("DB pool exhausted recording outcome: {e}"),
                            }
                        }
                    }
                }
            })
            .await;

        let conn = get_connection(&self.db_pool)?;
        let (sent, failed, still_pending) = db::recipient_counts(&conn, broadcast_id)?;
        if still_pending == 0 {
            // Every recipient settled — the run finished, even if every
            // single outcome is a failure.
            db::complete_broadcast(&conn, broadcast_id)?;
        } else {
            log::warn!(
                "Broadcast {broadcast_id} still has {still_pending} pending recipient(s), \
                 will resume next tick"
            );
        }
        Ok(RunSummary { sent, failed })
    }
}

/// Render a broadcast's stored content as one outbound message.
fn render_broadcast(broadcast: &Broadcast) -> OutboundMessage {
    OutboundMessage {
        content_type: broadcast.content_type,
        text: broadcast.content_text.clone(),
        media: broadcast.media_refs.clone(),
        buttons: Vec::new(),
    }
}
