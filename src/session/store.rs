use crate::session::Session;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Listing entry for `sessions list`.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Pluggable session persistence (file-based, database, in-memory for tests).
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self) -> Result<Session>;

    async fn get(&self, id: &str) -> Result<Option<Session>>;

    /// Persist the full session state (messages, turns, grants, usage).
    async fn save(&self, session: &Session) -> Result<()>;

    async fn list(&self) -> Result<Vec<SessionSummary>>;
}
