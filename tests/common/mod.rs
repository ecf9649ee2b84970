//! Shared fixtures for the integration tests: a scratch database and a
//! scripted in-memory delivery adapter.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use tempfile::TempDir;

use funnelgram::core::errors::DeliveryError;
use funnelgram::delivery::{ContentType, DeliveryAck, DeliveryAdapter, OutboundMessage, Recipient};
use funnelgram::storage::db;
use funnelgram::storage::{create_pool, get_connection, DbConnection, DbPool};

/// Scratch database in a temp directory, dropped with the test.
pub struct TestEnvironment {
    pub pool: Arc<DbPool>,
    _dir: TempDir,
}

impl TestEnvironment {
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("test.sqlite");
        let pool = create_pool(path.to_str().expect("utf-8 temp path")).expect("create pool");
        Self {
            pool: Arc::new(pool),
            _dir: dir,
        }
    }

    #[allow(clippy::expect_used, dead_code)]
    pub fn conn(&self) -> DbConnection {
        get_connection(&self.pool).expect("pool connection")
    }

    #[allow(clippy::expect_used, dead_code)]
    pub fn seed_project(&self) -> i64 {
        db::create_project(&self.conn(), "test project", "42:TEST", None).expect("create project")
    }
}

/// Delivery adapter double: records every send, optionally failing
/// scripted chat ids.
#[derive(Default)]
pub struct MockDelivery {
    sent: Mutex<Vec<(Recipient, ContentType)>>,
    fail_chats: Mutex<HashSet<i64>>,
    delay: Option<std::time::Duration>,
}

#[allow(dead_code)]
impl MockDelivery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adapter whose sends take `delay`, to widen race windows.
    pub fn slow(delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    /// Make every send to `chat_id` fail permanently.
    pub fn fail_chat(&self, chat_id: i64) {
        self.fail_chats.lock().unwrap().insert(chat_id);
    }

    pub fn sent(&self) -> Vec<(Recipient, ContentType)> {
        self.sent.lock().unwrap().clone()
    }

    /// Number of sends attempted to one chat (failures included).
    pub fn attempts_to(&self, chat_id: i64) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to.chat_id == chat_id)
            .count()
    }

    pub fn total_attempts(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliveryAdapter for MockDelivery {
    async fn send(
        &self,
        to: &Recipient,
        message: &OutboundMessage,
    ) -> Result<DeliveryAck, DeliveryError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().unwrap().push((*to, message.content_type));
        if self.fail_chats.lock().unwrap().contains(&to.chat_id) {
            return Err(DeliveryError::Permanent("scripted failure".to_string()));
        }
        Ok(DeliveryAck::default())
    }
}

/// Outcomes per chat id for a broadcast, keyed for easy assertions.
#[allow(dead_code, clippy::expect_used)]
pub fn ledger_by_chat(conn: &rusqlite::Connection, broadcast_id: i64) -> HashMap<i64, String> {
    let mut stmt = conn
        .prepare("SELECT chat_id, outcome FROM broadcast_recipients WHERE broadcast_id = ?1")
        .expect("prepare ledger query");
    let rows = stmt
        .query_map([broadcast_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .expect("query ledger");
    rows.map(|r| r.expect("ledger row")).collect()
}
