use async_trait::async_trait;
use manager_sdk::protocol::{RunRecord, SessionRecord};
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::audit::{
    messages_after, AuditError, AuditStore, ErrorRecord, EventRecord, MessageRecord,
};

const KEY_PREFIX: &str = "mcp-audit";
/// Audit rows outlive their session by a day so replays after a takeover work.
const TTL_SECONDS: i64 = 24 * 60 * 60;

fn session_key(id: &str) -> String {
    format!("{KEY_PREFIX}:sessions:{id}")
}

fn run_key(id: &str) -> String {
    format!("{KEY_PREFIX}:runs:{id}")
}

fn messages_key(external_session_id: &str) -> String {
    format!("{KEY_PREFIX}:messages:{external_session_id}")
}

fn errors_key(session_id: &str) -> String {
    format!("{KEY_PREFIX}:errors:{session_id}")
}

fn events_key(session_id: &str) -> String {
    format!("{KEY_PREFIX}:events:{session_id}")
}

fn backend(err: impl std::fmt::Display) -> AuditError {
    AuditError::Backend(err.to_string())
}

#[derive(Clone)]
pub struct RedisAuditStore {
    conn: ConnectionManager,
}

impl RedisAuditStore {
    pub async fn connect(url: &str) -> Result<Self, AuditError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = ConnectionManager::new(client).await.map_err(backend)?;
        Ok(Self { conn })
    }

    async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), AuditError> {
        let payload = serde_json::to_string(value).map_err(backend)?;
        let mut conn = self.conn.clone();
        redis::cmd("SETEX")
            .arg(key)
            .arg(TTL_SECONDS)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn push<T: Serialize>(&self, key: &str, value: &T) -> Result<(), AuditError> {
        let payload = serde_json::to_string(value).map_err(backend)?;
        let mut conn = self.conn.clone();
        redis::cmd("RPUSH")
            .arg(key)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(backend)?;
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(TTL_SECONDS)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AuditError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(backend))
            .transpose()
    }
}

#[async_trait]
impl AuditStore for RedisAuditStore {
    async fn create_session(&self, session: SessionRecord) -> Result<(), AuditError> {
        self.set(&session_key(&session.id), &session).await
    }

    async fn save_session(&self, session: SessionRecord) -> Result<(), AuditError> {
        self.set(&session_key(&session.id), &session).await
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, AuditError> {
        self.get(&session_key(id)).await
    }

    async fn create_run(&self, run: RunRecord) -> Result<(), AuditError> {
        self.set(&run_key(&run.id), &run).await
    }

    async fn save_run(&self, run: RunRecord) -> Result<(), AuditError> {
        self.set(&run_key(&run.id), &run).await
    }

    async fn create_message(&self, message: MessageRecord) -> Result<(), AuditError> {
        self.push(&messages_key(&message.external_session_id), &message)
            .await
    }

    async fn create_error(&self, error: ErrorRecord) -> Result<(), AuditError> {
        self.push(&errors_key(&error.session_id), &error).await
    }

    async fn create_event(&self, event: EventRecord) -> Result<(), AuditError> {
        self.push(&events_key(&event.session_id), &event).await
    }

    async fn list_messages_after(
        &self,
        external_session_id: &str,
        after_uuid: &str,
    ) -> Result<Vec<MessageRecord>, AuditError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(messages_key(external_session_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        let messages = raw
            .iter()
            .map(|item| serde_json::from_str::<MessageRecord>(item).map_err(backend))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages_after(messages, after_uuid))
    }
}
