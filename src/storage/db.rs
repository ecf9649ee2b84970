use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use strum::{Display, EnumString};

use crate::core::errors::BotError;
use crate::delivery::{validate_content, Button, ContentType, MediaRef};
use crate::storage::migrations;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Create a new database connection pool and bring the schema up to date.
///
/// Every pooled connection gets a busy timeout: a write landing while
/// another writer holds the lock must wait it out, not error. The
/// engines rely on this — their post-delivery bookkeeping writes have
/// to commit, or a step/recipient already sent would look unsent.
pub fn create_pool(database_path: &str) -> anyhow::Result<DbPool> {
    let manager = SqliteConnectionManager::file(database_path).with_init(|conn| {
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON")
    });
    let pool = Pool::builder().max_size(10).build(manager)?;

    let mut conn = pool.get()?;
    migrations::run_migrations(&mut conn)?;

    Ok(pool)
}

/// Get a connection from the pool. Returned to the pool on drop.
pub fn get_connection(pool: &DbPool) -> Result<DbConnection, r2d2::Error> {
    pool.get()
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A bot project. Carries the transport credentials for its audience.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub bot_token: String,
    pub admin_chat_id: Option<i64>,
}

/// One step of a project's funnel: content plus the delay gating it.
#[derive(Debug, Clone)]
pub struct FunnelStep {
    pub id: i64,
    pub project_id: i64,
    /// Positive, unique per project; defines the total order. Gaps are
    /// allowed — advancement is by value, never by array index.
    pub step_number: u32,
    /// Seconds after the previous step (or enrollment for the first
    /// step) before this step becomes due.
    pub delay_seconds: u32,
    pub content_type: ContentType,
    pub content_text: Option<String>,
    pub media_refs: Vec<MediaRef>,
    pub buttons: Vec<Button>,
}

/// Subscriber activity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum SubscriberStatus {
    Active,
    Blocked,
}

/// A funnel subscriber. `funnel_step` is the step number most recently
/// completed (0 = not started) and only ever grows.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: i64,
    pub project_id: i64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub status: SubscriberStatus,
    pub funnel_step: u32,
    pub enrolled_at: i64,
    pub last_step_completed_at: Option<i64>,
}

impl Subscriber {
    /// Epoch second the next delay window counts from.
    pub fn delay_origin(&self) -> i64 {
        if self.funnel_step == 0 {
            self.enrolled_at
        } else {
            self.last_step_completed_at.unwrap_or(self.enrolled_at)
        }
    }
}

/// Who a broadcast goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TargetAudience {
    All,
    Active,
}

/// Broadcast lifecycle. Transitions are forward-only:
/// draft → {scheduled, sending} → sending → {completed, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BroadcastStatus {
    Draft,
    Scheduled,
    Sending,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Broadcast {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub content_type: ContentType,
    pub content_text: Option<String>,
    pub media_refs: Vec<MediaRef>,
    pub target_audience: TargetAudience,
    pub status: BroadcastStatus,
    pub scheduled_at: Option<i64>,
    pub sent_count: u32,
}

/// Per-recipient delivery outcome within one broadcast run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RecipientOutcome {
    Pending,
    Sent,
    Failed,
}

/// One row of the broadcast delivery ledger.
#[derive(Debug, Clone)]
pub struct BroadcastRecipient {
    pub broadcast_id: i64,
    pub subscriber_id: i64,
    pub chat_id: i64,
    pub outcome: RecipientOutcome,
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn parse_enum<T>(value: String, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
{
    value.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unrecognized enum value '{value}'").into(),
        )
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(value: String, idx: usize) -> rusqlite::Result<T> {
    serde_json::from_str(&value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_step_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FunnelStep> {
    Ok(FunnelStep {
        id: row.get(0)?,
        project_id: row.get(1)?,
        step_number: row.get(2)?,
        delay_seconds: row.get(3)?,
        content_type: parse_enum(row.get::<_, String>(4)?, 4)?,
        content_text: row.get(5)?,
        media_refs: parse_json(row.get::<_, String>(6)?, 6)?,
        buttons: parse_json(row.get::<_, String>(7)?, 7)?,
    })
}

const STEP_COLUMNS: &str =
    "id, project_id, step_number, delay_seconds, content_type, content_text, media_refs, buttons";

fn parse_subscriber_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscriber> {
    Ok(Subscriber {
        id: row.get(0)?,
        project_id: row.get(1)?,
        telegram_id: row.get(2)?,
        username: row.get(3)?,
        status: parse_enum(row.get::<_, String>(4)?, 4)?,
        funnel_step: row.get(5)?,
        enrolled_at: row.get(6)?,
        last_step_completed_at: row.get(7)?,
    })
}

const SUBSCRIBER_COLUMNS: &str =
    "id, project_id, telegram_id, username, status, funnel_step, enrolled_at, last_step_completed_at";

fn parse_broadcast_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Broadcast> {
    Ok(Broadcast {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        content_type: parse_enum(row.get::<_, String>(3)?, 3)?,
        content_text: row.get(4)?,
        media_refs: parse_json(row.get::<_, String>(5)?, 5)?,
        target_audience: parse_enum(row.get::<_, String>(6)?, 6)?,
        status: parse_enum(row.get::<_, String>(7)?, 7)?,
        scheduled_at: row.get(8)?,
        sent_count: row.get(9)?,
    })
}

const BROADCAST_COLUMNS: &str = "id, project_id, name, content_type, content_text, media_refs, \
     target_audience, status, scheduled_at, sent_count";

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

pub fn create_project(
    conn: &Connection,
    name: &str,
    bot_token: &str,
    admin_chat_id: Option<i64>,
) -> Result<i64, BotError> {
    conn.execute(
        "INSERT INTO projects (name, bot_token, admin_chat_id) VALUES (?1, ?2, ?3)",
        params![name, bot_token, admin_chat_id],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_project(conn: &Connection, project_id: i64) -> Result<Option<Project>, BotError> {
    let project = conn
        .query_row(
            "SELECT id, name, bot_token, admin_chat_id FROM projects WHERE id = ?1",
            params![project_id],
            |row| {
                Ok(Project {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    bot_token: row.get(2)?,
                    admin_chat_id: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(project)
}

// ---------------------------------------------------------------------------
// Funnel steps
// ---------------------------------------------------------------------------

/// Insert or replace a funnel step definition (operator console write).
pub fn upsert_step(
    conn: &Connection,
    project_id: i64,
    step_number: u32,
    delay_seconds: u32,
    content_type: ContentType,
    content_text: Option<&str>,
    media_refs: &[MediaRef],
    buttons: &[Button],
) -> Result<i64, BotError> {
    if step_number == 0 {
        return Err(BotError::Validation("step_number must be positive".into()));
    }
    validate_content(content_type, content_text, media_refs, buttons)?;

    let media_json =
        serde_json::to_string(media_refs).map_err(|source| BotError::BadColumn {
            column: "media_refs",
            source,
        })?;
    let buttons_json = serde_json::to_string(buttons).map_err(|source| BotError::BadColumn {
        column: "buttons",
        source,
    })?;

    conn.execute(
        "INSERT INTO funnel_steps
            (project_id, step_number, delay_seconds, content_type, content_text, media_refs, buttons)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (project_id, step_number) DO UPDATE SET
            delay_seconds = excluded.delay_seconds,
            content_type = excluded.content_type,
            content_text = excluded.content_text,
            media_refs = excluded.media_refs,
            buttons = excluded.buttons",
        params![
            project_id,
            step_number,
            delay_seconds,
            content_type.to_string(),
            content_text,
            media_json,
            buttons_json
        ],
    )?;
    let id = conn.query_row(
        "SELECT id FROM funnel_steps WHERE project_id = ?1 AND step_number = ?2",
        params![project_id, step_number],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn list_steps(conn: &Connection, project_id: i64) -> Result<Vec<FunnelStep>, BotError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STEP_COLUMNS} FROM funnel_steps WHERE project_id = ?1 ORDER BY step_number"
    ))?;
    let steps = stmt
        .query_map(params![project_id], parse_step_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(steps)
}

/// The candidate next step: smallest step_number strictly greater than
/// `after`. `None` means the subscriber is at a terminal position.
pub fn next_step_after(
    conn: &Connection,
    project_id: i64,
    after: u32,
) -> Result<Option<FunnelStep>, BotError> {
    let step = conn
        .query_row(
            &format!(
                "SELECT {STEP_COLUMNS} FROM funnel_steps
                 WHERE project_id = ?1 AND step_number > ?2
                 ORDER BY step_number LIMIT 1"
            ),
            params![project_id, after],
            parse_step_row,
        )
        .optional()?;
    Ok(step)
}

pub fn delete_step(conn: &Connection, project_id: i64, step_number: u32) -> Result<bool, BotError> {
    let changed = conn.execute(
        "DELETE FROM funnel_steps WHERE project_id = ?1 AND step_number = ?2",
        params![project_id, step_number],
    )?;
    Ok(changed > 0)
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Register a subscriber at funnel position 0. Idempotent per
/// (project, telegram_id); returns the row id either way.
pub fn enroll_subscriber(
    conn: &Connection,
    project_id: i64,
    telegram_id: i64,
    username: Option<&str>,
    now: i64,
) -> Result<i64, BotError> {
    conn.execute(
        "INSERT INTO subscribers (project_id, telegram_id, username, enrolled_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (project_id, telegram_id) DO NOTHING",
        params![project_id, telegram_id, username, now],
    )?;
    let id = conn.query_row(
        "SELECT id FROM subscribers WHERE project_id = ?1 AND telegram_id = ?2",
        params![project_id, telegram_id],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn get_subscriber(conn: &Connection, id: i64) -> Result<Option<Subscriber>, BotError> {
    let sub = conn
        .query_row(
            &format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE id = ?1"),
            params![id],
            parse_subscriber_row,
        )
        .optional()?;
    Ok(sub)
}

/// All ACTIVE subscribers across every project — the funnel due-set
/// candidates for one scheduling pass.
pub fn list_funnel_candidates(conn: &Connection) -> Result<Vec<Subscriber>, BotError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE status = 'ACTIVE'"
    ))?;
    let subs = stmt
        .query_map([], parse_subscriber_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(subs)
}

/// Subscribers matching a broadcast audience filter for one project.
pub fn list_subscribers(
    conn: &Connection,
    project_id: i64,
    audience: TargetAudience,
) -> Result<Vec<Subscriber>, BotError> {
    let sql = match audience {
        TargetAudience::All => {
            format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE project_id = ?1")
        }
        TargetAudience::Active => format!(
            "SELECT {SUBSCRIBER_COLUMNS} FROM subscribers
             WHERE project_id = ?1 AND status = 'ACTIVE'"
        ),
    };
    let mut stmt = conn.prepare(&sql)?;
    let subs = stmt
        .query_map(params![project_id], parse_subscriber_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(subs)
}

pub fn set_subscriber_status(
    conn: &Connection,
    id: i64,
    status: SubscriberStatus,
) -> Result<bool, BotError> {
    let changed = conn.execute(
        "UPDATE subscribers SET status = ?1 WHERE id = ?2",
        params![status.to_string(), id],
    )?;
    Ok(changed > 0)
}

pub fn delete_subscriber(conn: &Connection, id: i64) -> Result<bool, BotError> {
    let changed = conn.execute("DELETE FROM subscribers WHERE id = ?1", params![id])?;
    Ok(changed > 0)
}

/// Conditionally advance a subscriber's funnel position.
///
/// The WHERE clause is the concurrency guard: the update lands only if
/// the row still holds `from_step` and the subscriber is still ACTIVE.
/// A `false` return is a lost race (or a mid-flight block/delete) — the
/// caller must treat its delivery decision as stale.
pub fn advance_funnel_step(
    conn: &Connection,
    id: i64,
    from_step: u32,
    to_step: u32,
    now: i64,
) -> Result<bool, BotError> {
    let changed = conn.execute(
        "UPDATE subscribers
         SET funnel_step = ?1, last_step_completed_at = ?2
         WHERE id = ?3 AND funnel_step = ?4 AND status = 'ACTIVE'",
        params![to_step, now, id, from_step],
    )?;
    Ok(changed > 0)
}

// ---------------------------------------------------------------------------
// Broadcasts
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
pub fn create_broadcast(
    conn: &Connection,
    project_id: i64,
    name: &str,
    content_type: ContentType,
    content_text: Option<&str>,
    media_refs: &[MediaRef],
    target_audience: TargetAudience,
    scheduled_at: Option<i64>,
) -> Result<i64, BotError> {
    validate_content(content_type, content_text, media_refs, &[])?;
    let media_json = serde_json::to_string(media_refs).map_err(|source| BotError::BadColumn {
        column: "media_refs",
        source,
    })?;
    conn.execute(
        "INSERT INTO broadcasts
            (project_id, name, content_type, content_text, media_refs, target_audience, scheduled_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            project_id,
            name,
            content_type.to_string(),
            content_text,
            media_json,
            target_audience.to_string(),
            scheduled_at
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_broadcast(conn: &Connection, id: i64) -> Result<Option<Broadcast>, BotError> {
    let broadcast = conn
        .query_row(
            &format!("SELECT {BROADCAST_COLUMNS} FROM broadcasts WHERE id = ?1"),
            params![id],
            parse_broadcast_row,
        )
        .optional()?;
    Ok(broadcast)
}

/// Operator start action. A draft with no `scheduled_at` goes straight
/// to `sending`; with one it becomes `scheduled`. Anything else is a
/// double start and is rejected.
pub fn start_broadcast(conn: &Connection, id: i64) -> Result<BroadcastStatus, BotError> {
    let broadcast =
        get_broadcast(conn, id)?.ok_or_else(|| BotError::Validation("no such broadcast".into()))?;
    if broadcast.status != BroadcastStatus::Draft {
        return Err(BotError::Validation(format!(
            "broadcast {id} already started (status: {})",
            broadcast.status
        )));
    }

    let next = if broadcast.scheduled_at.is_some() {
        BroadcastStatus::Scheduled
    } else {
        BroadcastStatus::Sending
    };
    let changed = conn.execute(
        "UPDATE broadcasts SET status = ?1 WHERE id = ?2 AND status = 'draft'",
        params![next.to_string(), id],
    )?;
    if changed == 0 {
        return Err(BotError::Validation(format!(
            "broadcast {id} already started"
        )));
    }
    Ok(next)
}

/// Claim scheduled broadcasts whose time has come (or passed — a missed
/// window still runs). Each claim is a scheduled→sending CAS, so two
/// dispatcher ticks cannot both own the same broadcast.
pub fn claim_due_scheduled(conn: &Connection, now: i64) -> Result<Vec<i64>, BotError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM broadcasts
         WHERE status = 'scheduled' AND scheduled_at <= ?1
         ORDER BY scheduled_at",
    )?;
    let due: Vec<i64> = stmt
        .query_map(params![now], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut claimed = Vec::new();
    for id in due {
        let changed = conn.execute(
            "UPDATE broadcasts SET status = 'sending' WHERE id = ?1 AND status = 'scheduled'",
            params![id],
        )?;
        if changed > 0 {
            claimed.push(id);
        }
    }
    Ok(claimed)
}

/// Broadcasts stuck in `sending` — a crashed run to resume.
pub fn sending_broadcast_ids(conn: &Connection) -> Result<Vec<i64>, BotError> {
    let mut stmt = conn.prepare("SELECT id FROM broadcasts WHERE status = 'sending'")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// Materialize the audience snapshot into the recipient ledger.
///
/// The snapshot is taken exactly once: if the ledger already has rows
/// for this broadcast (a crash resume), it is left untouched, so
/// subscribers added or toggled after run start never join mid-run.
pub fn snapshot_audience(conn: &Connection, broadcast: &Broadcast) -> Result<usize, BotError> {
    let existing: i64 = conn.query_row(
        "SELECT COUNT(*) FROM broadcast_recipients WHERE broadcast_id = ?1",
        params![broadcast.id],
        |row| row.get(0),
    )?;
    if existing > 0 {
        return Ok(existing as usize);
    }

    let sql = match broadcast.target_audience {
        TargetAudience::All => {
            "INSERT OR IGNORE INTO broadcast_recipients (broadcast_id, subscriber_id, chat_id)
             SELECT ?1, id, telegram_id FROM subscribers WHERE project_id = ?2"
        }
        TargetAudience::Active => {
            "INSERT OR IGNORE INTO broadcast_recipients (broadcast_id, subscriber_id, chat_id)
             SELECT ?1, id, telegram_id FROM subscribers
             WHERE project_id = ?2 AND status = 'ACTIVE'"
        }
    };
    let inserted = conn.execute(sql, params![broadcast.id, broadcast.project_id])?;
    Ok(inserted)
}

/// Ledger rows still awaiting delivery for one broadcast.
pub fn pending_recipients(
    conn: &Connection,
    broadcast_id: i64,
) -> Result<Vec<BroadcastRecipient>, BotError> {
    let mut stmt = conn.prepare(
        "SELECT broadcast_id, subscriber_id, chat_id, outcome
         FROM broadcast_recipients
         WHERE broadcast_id = ?1 AND outcome = 'pending'",
    )?;
    let rows = stmt
        .query_map(params![broadcast_id], |row| {
            Ok(BroadcastRecipient {
                broadcast_id: row.get(0)?,
                subscriber_id: row.get(1)?,
                chat_id: row.get(2)?,
                outcome: parse_enum(row.get::<_, String>(3)?, 3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Record a successful delivery and bump `sent_count` atomically.
/// The pending-only CAS makes a raced double-record impossible.
pub fn mark_recipient_sent(
    conn: &mut Connection,
    broadcast_id: i64,
    subscriber_id: i64,
    now: i64,
) -> Result<bool, BotError> {
    let tx = conn.transaction()?;
    let changed = tx.execute(
        "UPDATE broadcast_recipients
         SET outcome = 'sent', updated_at = ?1
         WHERE broadcast_id = ?2 AND subscriber_id = ?3 AND outcome = 'pending'",
        params![now, broadcast_id, subscriber_id],
    )?;
    if changed > 0 {
        tx.execute(
            "UPDATE broadcasts SET sent_count = sent_count + 1 WHERE id = ?1",
            params![broadcast_id],
        )?;
    }
    tx.commit()?;
    Ok(changed > 0)
}

/// Record a failed delivery. Failed recipients are never retried within
/// the run; they stay visible in the ledger for operator follow-up.
pub fn mark_recipient_failed(
    conn: &Connection,
    broadcast_id: i64,
    subscriber_id: i64,
    now: i64,
) -> Result<bool, BotError> {
    let changed = conn.execute(
        "UPDATE broadcast_recipients
         SET outcome = 'failed', updated_at = ?1
         WHERE broadcast_id = ?2 AND subscriber_id = ?3 AND outcome = 'pending'",
        params![now, broadcast_id, subscriber_id],
    )?;
    Ok(changed > 0)
}

/// Ledger tallies: (sent, failed, pending).
pub fn recipient_counts(conn: &Connection, broadcast_id: i64) -> Result<(u32, u32, u32), BotError> {
    conn.query_row(
        "SELECT
            COUNT(*) FILTER (WHERE outcome = 'sent'),
            COUNT(*) FILTER (WHERE outcome = 'failed'),
            COUNT(*) FILTER (WHERE outcome = 'pending')
         FROM broadcast_recipients WHERE broadcast_id = ?1",
        params![broadcast_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
    .map_err(BotError::from)
}

/// Close out a finished run: sending → completed, with `sent_count`
/// resynced from the ledger (heals any increment lost to a crash).
pub fn complete_broadcast(conn: &Connection, broadcast_id: i64) -> Result<bool, BotError> {
    let changed = conn.execute(
        "UPDATE broadcasts
         SET status = 'completed',
             sent_count = (SELECT COUNT(*) FROM broadcast_recipients
                           WHERE broadcast_id = ?1 AND outcome = 'sent')
         WHERE id = ?1 AND status = 'sending'",
        params![broadcast_id],
    )?;
    Ok(changed > 0)
}

/// Terminal failure: the run itself could not finish (project gone,
/// transport unconstructible). Per-recipient failures do NOT land here.
pub fn fail_broadcast(conn: &Connection, broadcast_id: i64) -> Result<bool, BotError> {
    let changed = conn.execute(
        "UPDATE broadcasts SET status = 'failed' WHERE id = ?1 AND status = 'sending'",
        params![broadcast_id],
    )?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{ButtonAction, MediaKind};

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        crate::storage::migrations::run_migrations_for_test(&mut conn).unwrap();
        conn
    }

    fn seed_project(conn: &Connection) -> i64 {
        create_project(conn, "test", "123:token", None).unwrap()
    }

    #[test]
    fn pool_brings_a_fresh_database_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.sqlite");
        let pool = create_pool(path.to_str().unwrap()).unwrap();
        let project = seed_project(&pool.get().unwrap());

        // Reopening an already-migrated database is a no-op, not an error
        drop(pool);
        let pool = create_pool(path.to_str().unwrap()).unwrap();
        assert!(get_project(&pool.get().unwrap(), project)
            .unwrap()
            .is_some());
    }

    #[test]
    fn next_step_lookup_skips_gaps() {
        let conn = test_conn();
        let project = seed_project(&conn);
        for n in [1, 3, 7] {
            upsert_step(&conn, project, n, 0, ContentType::Text, Some("hi"), &[], &[]).unwrap();
        }

        let next = next_step_after(&conn, project, 0).unwrap().unwrap();
        assert_eq!(next.step_number, 1);
        let next = next_step_after(&conn, project, 1).unwrap().unwrap();
        assert_eq!(next.step_number, 3);
        let next = next_step_after(&conn, project, 4).unwrap().unwrap();
        assert_eq!(next.step_number, 7);
        assert!(next_step_after(&conn, project, 7).unwrap().is_none());
    }

    #[test]
    fn step_media_and_buttons_round_trip() {
        let conn = test_conn();
        let project = seed_project(&conn);
        let media = vec![MediaRef {
            file_ref: "AgACAgIAAx".to_string(),
            kind: MediaKind::Photo,
        }];
        let buttons = vec![Button {
            label: "Открыть".to_string(),
            action: ButtonAction::OpenLink("https://example.com".to_string()),
        }];
        upsert_step(
            &conn,
            project,
            1,
            60,
            ContentType::Photo,
            Some("caption"),
            &media,
            &buttons,
        )
        .unwrap();

        let steps = list_steps(&conn, project).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].media_refs, media);
        assert_eq!(steps[0].buttons, buttons);
        assert_eq!(steps[0].delay_seconds, 60);
    }

    #[test]
    fn invalid_step_definitions_are_rejected() {
        let conn = test_conn();
        let project = seed_project(&conn);
        assert!(upsert_step(&conn, project, 0, 0, ContentType::Text, Some("x"), &[], &[]).is_err());
        assert!(upsert_step(&conn, project, 1, 0, ContentType::Text, None, &[], &[]).is_err());
        assert!(upsert_step(&conn, project, 1, 0, ContentType::Photo, None, &[], &[]).is_err());
    }

    #[test]
    fn advance_is_a_compare_and_swap() {
        let conn = test_conn();
        let project = seed_project(&conn);
        let sub = enroll_subscriber(&conn, project, 42, None, 1000).unwrap();

        assert!(advance_funnel_step(&conn, sub, 0, 1, 1010).unwrap());
        // Stale evaluator loses the race
        assert!(!advance_funnel_step(&conn, sub, 0, 1, 1010).unwrap());

        let row = get_subscriber(&conn, sub).unwrap().unwrap();
        assert_eq!(row.funnel_step, 1);
        assert_eq!(row.last_step_completed_at, Some(1010));
    }

    #[test]
    fn blocked_subscriber_cannot_advance() {
        let conn = test_conn();
        let project = seed_project(&conn);
        let sub = enroll_subscriber(&conn, project, 42, None, 1000).unwrap();
        set_subscriber_status(&conn, sub, SubscriberStatus::Blocked).unwrap();
        assert!(!advance_funnel_step(&conn, sub, 0, 1, 1010).unwrap());
    }

    #[test]
    fn enrollment_is_idempotent() {
        let conn = test_conn();
        let project = seed_project(&conn);
        let first = enroll_subscriber(&conn, project, 42, Some("alice"), 1000).unwrap();
        let second = enroll_subscriber(&conn, project, 42, Some("alice"), 2000).unwrap();
        assert_eq!(first, second);
        let row = get_subscriber(&conn, first).unwrap().unwrap();
        assert_eq!(row.enrolled_at, 1000);
    }

    #[test]
    fn broadcast_start_transitions() {
        let conn = test_conn();
        let project = seed_project(&conn);

        let immediate = create_broadcast(
            &conn,
            project,
            "now",
            ContentType::Text,
            Some("hello"),
            &[],
            TargetAudience::All,
            None,
        )
        .unwrap();
        assert_eq!(
            start_broadcast(&conn, immediate).unwrap(),
            BroadcastStatus::Sending
        );
        // No double start
        assert!(start_broadcast(&conn, immediate).is_err());

        let scheduled = create_broadcast(
            &conn,
            project,
            "later",
            ContentType::Text,
            Some("hello"),
            &[],
            TargetAudience::Active,
            Some(5000),
        )
        .unwrap();
        assert_eq!(
            start_broadcast(&conn, scheduled).unwrap(),
            BroadcastStatus::Scheduled
        );

        assert!(claim_due_scheduled(&conn, 4999).unwrap().is_empty());
        assert_eq!(claim_due_scheduled(&conn, 5000).unwrap(), vec![scheduled]);
        // Already claimed
        assert!(claim_due_scheduled(&conn, 5000).unwrap().is_empty());
    }

    #[test]
    fn snapshot_respects_audience_filter_and_is_idempotent() {
        let conn = test_conn();
        let project = seed_project(&conn);
        enroll_subscriber(&conn, project, 1, None, 0).unwrap();
        enroll_subscriber(&conn, project, 2, None, 0).unwrap();
        let blocked = enroll_subscriber(&conn, project, 3, None, 0).unwrap();
        set_subscriber_status(&conn, blocked, SubscriberStatus::Blocked).unwrap();

        let id = create_broadcast(
            &conn,
            project,
            "b",
            ContentType::Text,
            Some("hi"),
            &[],
            TargetAudience::Active,
            None,
        )
        .unwrap();
        start_broadcast(&conn, id).unwrap();
        let broadcast = get_broadcast(&conn, id).unwrap().unwrap();

        assert_eq!(snapshot_audience(&conn, &broadcast).unwrap(), 2);
        // Later status changes must not grow an existing ledger
        set_subscriber_status(&conn, blocked, SubscriberStatus::Active).unwrap();
        assert_eq!(snapshot_audience(&conn, &broadcast).unwrap(), 2);
    }

    #[test]
    fn recipient_outcome_is_recorded_once() {
        let mut conn = test_conn();
        let project = seed_project(&conn);
        let sub = enroll_subscriber(&conn, project, 1, None, 0).unwrap();
        let id = create_broadcast(
            &conn,
            project,
            "b",
            ContentType::Text,
            Some("hi"),
            &[],
            TargetAudience::All,
            None,
        )
        .unwrap();
        start_broadcast(&conn, id).unwrap();
        let broadcast = get_broadcast(&conn, id).unwrap().unwrap();
        snapshot_audience(&conn, &broadcast).unwrap();

        assert!(mark_recipient_sent(&mut conn, id, sub, 100).unwrap());
        assert!(!mark_recipient_sent(&mut conn, id, sub, 100).unwrap());
        assert!(!mark_recipient_failed(&conn, id, sub, 100).unwrap());

        let (sent, failed, pending) = recipient_counts(&conn, id).unwrap();
        assert_eq!((sent, failed, pending), (1, 0, 0));
        let row = get_broadcast(&conn, id).unwrap().unwrap();
        assert_eq!(row.sent_count, 1);
    }
}
