//! Background engine that advances subscribers through their funnels.
//!
//! Runs as a `tokio::spawn`ed task. Each pass loads the ACTIVE
//! subscribers across all projects, finds whose next step is due, and
//! delivers it. Different subscribers are evaluated in parallel; one
//! subscriber is always strictly serialized, and the position update is
//! a conditional write keyed on the previous step — so a step can never
//! be delivered twice even with overlapping passes.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::core::config;
use crate::core::errors::BotError;
use crate::delivery::{DeliveryAdapter, OutboundMessage, Recipient};
use crate::storage::db::{self, DbPool, FunnelStep, Subscriber, SubscriberStatus};
use crate::storage::get_connection;

/// Counters from one scheduling pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    /// Steps delivered and committed.
    pub delivered: u32,
    /// Conditional updates that lost a race (retried next pass).
    pub conflicts: u32,
    /// Deliveries that failed (step stays due, retried next pass).
    pub failures: u32,
}

pub struct FunnelEngine {
    db_pool: Arc<DbPool>,
    adapter: Arc<dyn DeliveryAdapter>,
    /// Per-subscriber mutexes; evaluation of one subscriber never overlaps.
    locks: DashMap<i64, Arc<Mutex<()>>>,
    max_parallel: usize,
}

impl FunnelEngine {
    pub fn new(db_pool: Arc<DbPool>, adapter: Arc<dyn DeliveryAdapter>) -> Arc<Self> {
        Arc::new(Self {
            db_pool,
            adapter,
            locks: DashMap::new(),
            max_parallel: config::funnel::MAX_PARALLEL_EVALUATIONS,
        })
    }

    /// Start the periodic scheduling loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(config::funnel::tick_interval());
            log::info!(
                "Funnel engine started (interval: {}s)",
                config::funnel::TICK_INTERVAL_SECS
            );

            loop {
                ticker.tick().await;
                match engine.run_pass().await {
                    Ok(stats) if stats != PassStats::default() => {
                        log::info!(
                            "Funnel pass: {} delivered, {} conflicts, {} failures",
                            stats.delivered,
                            stats.conflicts,
                            stats.failures
                        );
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Funnel pass failed: {e}"),
                }
            }
        })
    }

    /// One scheduling pass at the current wall clock.
    pub async fn run_pass(&self) -> Result<PassStats, BotError> {
        self.run_pass_at(Utc::now().timestamp()).await
    }

    /// One scheduling pass evaluating dueness against `now`.
    pub async fn run_pass_at(&self, now: i64) -> Result<PassStats, BotError> {
        let candidates = {
            let conn = get_connection(&self.db_pool)?;
            db::list_funnel_candidates(&conn)?
        };
        if candidates.is_empty() {
            return Ok(PassStats::default());
        }

        // Steps change rarely; load each project's list once per pass
        // for the cheap pre-filter below. The authoritative lookup
        // happens again under the per-subscriber lock.
        let mut steps_by_project: HashMap<i64, Vec<FunnelStep>> = HashMap::new();
        {
            let conn = get_connection(&self.db_pool)?;
            for sub in &candidates {
                if !steps_by_project.contains_key(&sub.project_id) {
                    steps_by_project.insert(sub.project_id, db::list_steps(&conn, sub.project_id)?);
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut handles = Vec::new();

        for sub in candidates {
            let steps = match steps_by_project.get(&sub.project_id) {
                Some(s) => s,
                None => continue,
            };
            if !has_due_step(&sub, steps, now) {
                continue;
            }

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let ctx = EvaluationContext {
                db_pool: Arc::clone(&self.db_pool),
                adapter: Arc::clone(&self.adapter),
                lock: self.subscriber_lock(sub.id),
            };
            let subscriber_id = sub.id;
            handles.push((
                subscriber_id,
                tokio::spawn(async move {
                    let outcome = ctx.evaluate(subscriber_id, now).await;
                    drop(permit);
                    outcome
                }),
            ));
        }

        let mut stats = PassStats::default();
        for (subscriber_id, handle) in handles {
            match handle.await {
                Ok(Ok(Evaluation::Delivered(step))) => {
                    stats.delivered += 1;
                    log::debug!("Delivered step {step}");
                }
                Ok(Ok(Evaluation::Skipped)) => {}
                Ok(Ok(Evaluation::Gone)) => {
                    // Keep the lock map bounded by the live subscriber set.
                    self.locks.remove(&subscriber_id);
                }
                Ok(Ok(Evaluation::Conflict)) => stats.conflicts += 1,
                Ok(Ok(Evaluation::DeliveryFailed)) => stats.failures += 1,
                Ok(Err(e)) => {
                    stats.failures += 1;
                    log::warn!("Subscriber evaluation failed: {e}");
                }
                Err(e) => {
                    stats.failures += 1;
                    log::error!("Evaluation task panicked: {e}");
                }
            }
        }
        Ok(stats)
    }

    fn subscriber_lock(&self, subscriber_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry(subscriber_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Evaluate one subscriber immediately (used by tests and the race
    /// guard property check); same path the pass takes.
    pub async fn evaluate_subscriber(
        &self,
        subscriber_id: i64,
        now: i64,
    ) -> Result<Evaluation, BotError> {
        let ctx = EvaluationContext {
            db_pool: Arc::clone(&self.db_pool),
            adapter: Arc::clone(&self.adapter),
            lock: self.subscriber_lock(subscriber_id),
        };
        let outcome = ctx.evaluate(subscriber_id, now).await?;
        if outcome == Evaluation::Gone {
            self.locks.remove(&subscriber_id);
        }
        Ok(outcome)
    }
}

/// Outcome of evaluating one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// The due step was delivered and the position committed.
    Delivered(u32),
    /// Nothing due (terminal position, delay not elapsed, or the
    /// subscriber was blocked since the candidate list).
    Skipped,
    /// The subscriber row no longer exists; its lock entry is dropped.
    Gone,
    /// The conditional position update lost a race; state untouched.
    Conflict,
    /// The transport refused the message; state untouched, step retried
    /// on the next pass.
    DeliveryFailed,
}

struct EvaluationContext {
    db_pool: Arc<DbPool>,
    adapter: Arc<dyn DeliveryAdapter>,
    lock: Arc<Mutex<()>>,
}

impl EvaluationContext {
    async fn evaluate(&self, subscriber_id: i64, now: i64) -> Result<Evaluation, BotError> {
        let _guard = self.lock.lock().await;

        // Fresh read under the lock; the candidate snapshot may be stale.
        let (sub, step) = {
            let conn = get_connection(&self.db_pool)?;
            let sub = match db::get_subscriber(&conn, subscriber_id)? {
                Some(s) if s.status == SubscriberStatus::Active => s,
                // Blocked since the pass started: terminal.
                Some(_) => return Ok(Evaluation::Skipped),
                None => return Ok(Evaluation::Gone),
            };
            let step = match db::next_step_after(&conn, sub.project_id, sub.funnel_step)? {
                Some(step) => step,
                None => return Ok(Evaluation::Skipped),
            };
            (sub, step)
        };

        if !is_due(&sub, &step, now) {
            return Ok(Evaluation::Skipped);
        }

        let message = render_step(&step);
        let recipient = Recipient {
            project_id: sub.project_id,
            chat_id: sub.telegram_id,
        };

        if let Err(err) = self.adapter.send(&recipient, &message).await {
            log::warn!(
                "Step {} delivery to subscriber {} failed: {err}",
                step.step_number,
                subscriber_id
            );
            return Ok(Evaluation::DeliveryFailed);
        }

        let conn = get_connection(&self.db_pool)?;
        let advanced = db::advance_funnel_step(
            &conn,
            subscriber_id,
            sub.funnel_step,
            step.step_number,
            now,
        )?;
        if advanced {
            Ok(Evaluation::Delivered(step.step_number))
        } else {
            // Someone else advanced (or blocked) this subscriber between
            // our read and the write. The message went out; the loser's
            // state change is discarded.
            log::warn!(
                "Stale advance for subscriber {subscriber_id} (expected step {})",
                sub.funnel_step
            );
            Ok(Evaluation::Conflict)
        }
    }
}

/// Whether the subscriber's candidate next step exists and its delay
/// window has elapsed.
fn has_due_step(sub: &Subscriber, steps: &[FunnelStep], now: i64) -> bool {
    steps
        .iter()
        .find(|s| s.step_number > sub.funnel_step)
        .is_some_and(|s| is_due(sub, s, now))
}

/// `now ≥ origin + delay`, where origin is enrollment for the first
/// step and the previous completion time after that.
fn is_due(sub: &Subscriber, step: &FunnelStep, now: i64) -> bool {
    now >= sub.delay_origin() + i64::from(step.delay_seconds)
}

/// Render a step's stored content as one outbound message. Literal
/// content only — no templating in this design.
fn render_step(step: &FunnelStep) -> OutboundMessage {
    OutboundMessage {
        content_type: step.content_type,
        text: step.content_text.clone(),
        media: step.media_refs.clone(),
        buttons: step.buttons.clone(),
    }
}
