//! Audit trail of sessions, runs, messages, errors and output.
//!
//! Writes on the RPC path go through [`AuditLog`], which spawns them so a slow
//! or failing store never stalls message delivery.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use manager_sdk::protocol::{McpOutput, MessageSender, RunRecord, SessionRecord, WireMessage};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::metrics::AUDIT_WRITES;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub session_id: String,
    pub external_session_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    pub sender: MessageSender,
    pub message: WireMessage,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub session_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub session_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    pub output: McpOutput,
    pub created_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit backend error: {0}")]
    Backend(String),
    #[error("audit record `{0}` not found")]
    NotFound(String),
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn create_session(&self, session: SessionRecord) -> Result<(), AuditError>;
    async fn save_session(&self, session: SessionRecord) -> Result<(), AuditError>;
    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, AuditError>;
    async fn create_run(&self, run: RunRecord) -> Result<(), AuditError>;
    async fn save_run(&self, run: RunRecord) -> Result<(), AuditError>;
    async fn create_message(&self, message: MessageRecord) -> Result<(), AuditError>;
    async fn create_error(&self, error: ErrorRecord) -> Result<(), AuditError>;
    async fn create_event(&self, event: EventRecord) -> Result<(), AuditError>;

    /// Messages of an external session persisted after the message carrying
    /// `after_uuid`, oldest first. An unknown uuid replays everything.
    async fn list_messages_after(
        &self,
        external_session_id: &str,
        after_uuid: &str,
    ) -> Result<Vec<MessageRecord>, AuditError>;
}

/// Shared replay cut used by every backend.
pub(crate) fn messages_after(messages: Vec<MessageRecord>, after_uuid: &str) -> Vec<MessageRecord> {
    match messages
        .iter()
        .position(|m| m.message.uuid == after_uuid)
    {
        Some(index) => messages.into_iter().skip(index + 1).collect(),
        None => messages,
    }
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    sessions: tokio::sync::Mutex<Vec<SessionRecord>>,
    runs: tokio::sync::Mutex<Vec<RunRecord>>,
    messages: tokio::sync::Mutex<Vec<MessageRecord>>,
    errors: tokio::sync::Mutex<Vec<ErrorRecord>>,
    events: tokio::sync::Mutex<Vec<EventRecord>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn sessions(&self) -> Vec<SessionRecord> {
        self.sessions.lock().await.clone()
    }

    pub async fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().await.clone()
    }

    pub async fn messages(&self) -> Vec<MessageRecord> {
        self.messages.lock().await.clone()
    }

    pub async fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.lock().await.clone()
    }

    pub async fn events(&self) -> Vec<EventRecord> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn create_session(&self, session: SessionRecord) -> Result<(), AuditError> {
        self.save_session(session).await
    }

    async fn save_session(&self, session: SessionRecord) -> Result<(), AuditError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.iter_mut().find(|s| s.id == session.id) {
            *existing = session;
        } else {
            sessions.push(session);
        }
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>, AuditError> {
        Ok(self
            .sessions
            .lock()
            .await
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn create_run(&self, run: RunRecord) -> Result<(), AuditError> {
        self.save_run(run).await
    }

    async fn save_run(&self, run: RunRecord) -> Result<(), AuditError> {
        let mut runs = self.runs.lock().await;
        if let Some(existing) = runs.iter_mut().find(|r| r.id == run.id) {
            *existing = run;
        } else {
            runs.push(run);
        }
        Ok(())
    }

    async fn create_message(&self, message: MessageRecord) -> Result<(), AuditError> {
        self.messages.lock().await.push(message);
        Ok(())
    }

    async fn create_error(&self, error: ErrorRecord) -> Result<(), AuditError> {
        self.errors.lock().await.push(error);
        Ok(())
    }

    async fn create_event(&self, event: EventRecord) -> Result<(), AuditError> {
        self.events.lock().await.push(event);
        Ok(())
    }

    async fn list_messages_after(
        &self,
        external_session_id: &str,
        after_uuid: &str,
    ) -> Result<Vec<MessageRecord>, AuditError> {
        let messages: Vec<MessageRecord> = self
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| m.external_session_id == external_session_id)
            .cloned()
            .collect();
        Ok(messages_after(messages, after_uuid))
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fire-and-forget front of an [`AuditStore`].
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn AuditStore> {
        Arc::clone(&self.store)
    }

    fn spawn<F, Fut>(&self, kind: &'static str, write: F)
    where
        F: FnOnce(Arc<dyn AuditStore>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), AuditError>> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match write(store).await {
                Ok(()) => AUDIT_WRITES.with_label_values(&[kind, "ok"]).inc(),
                Err(err) => {
                    AUDIT_WRITES.with_label_values(&[kind, "error"]).inc();
                    warn!(kind, error = %err, "audit write failed");
                }
            }
        });
    }

    pub fn save_session(&self, session: SessionRecord) {
        self.spawn("session", move |store| async move {
            store.save_session(session).await
        });
    }

    pub fn save_run(&self, run: RunRecord) {
        self.spawn("run", move |store| async move { store.save_run(run).await });
    }

    pub fn message(
        &self,
        session_id: &str,
        external_session_id: &str,
        run_id: Option<String>,
        sender: MessageSender,
        message: WireMessage,
    ) {
        let record = MessageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            external_session_id: external_session_id.to_string(),
            run_id,
            sender,
            message,
            created_at: now_ms(),
        };
        self.spawn("message", move |store| async move {
            store.create_message(record).await
        });
    }

    pub fn error(
        &self,
        session_id: &str,
        run_id: Option<String>,
        code: &str,
        message: String,
        details: BTreeMap<String, String>,
    ) {
        let record = ErrorRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            run_id,
            code: code.to_string(),
            message,
            details,
            created_at: now_ms(),
        };
        self.spawn("error", move |store| async move {
            store.create_error(record).await
        });
    }

    pub fn event(&self, session_id: &str, run_id: Option<String>, output: McpOutput) {
        let record = EventRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            run_id,
            output,
            created_at: now_ms(),
        };
        self.spawn("event", move |store| async move {
            store.create_event(record).await
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manager_sdk::protocol::McpMessageType;

    fn message(external: &str, uuid: &str) -> MessageRecord {
        MessageRecord {
            id: format!("rec-{uuid}"),
            session_id: "audit-1".into(),
            external_session_id: external.into(),
            run_id: None,
            sender: MessageSender::Server,
            message: WireMessage {
                uuid: uuid.into(),
                message_type: McpMessageType::Notification,
                id: None,
                method: Some("notifications/progress".into()),
                sender: Some(MessageSender::Server),
                raw: r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#.into(),
            },
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn replays_messages_after_uuid_for_one_session() {
        let store = InMemoryAuditStore::new();
        for (external, uuid) in [("s1", "a"), ("s2", "x"), ("s1", "b"), ("s1", "c")] {
            store.create_message(message(external, uuid)).await.unwrap();
        }

        let after_a = store.list_messages_after("s1", "a").await.unwrap();
        let uuids: Vec<_> = after_a.iter().map(|m| m.message.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["b", "c"]);

        let unknown = store.list_messages_after("s1", "zzz").await.unwrap();
        assert_eq!(unknown.len(), 3);

        assert!(store.list_messages_after("s1", "c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn audit_log_writes_in_background() {
        let store = InMemoryAuditStore::new();
        let log = AuditLog::new(store.clone());
        log.error("audit-1", None, "worker_failed", "boom".into(), BTreeMap::new());

        for _ in 0..50 {
            if !store.errors().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let errors = store.errors().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "worker_failed");
    }
}
