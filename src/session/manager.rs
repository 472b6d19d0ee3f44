use crate::session::store::{SessionStore, SessionSummary};
use crate::session::{ConversationMessage, Session, Turn, Usage};
use crate::utils::{atomic_write, ensure_dir, safe_filename};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::warn;

const MAX_CACHED_SESSIONS: usize = 64;

/// File-backed session store: one journal file per session under
/// `<home>/sessions/`, metadata line first, then one line per message and
/// per turn.
pub struct SessionManager {
    sessions_dir: PathBuf,
    cache: Mutex<LruCache<String, Session>>,
}

impl SessionManager {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let sessions_dir = ensure_dir(base_dir.join("sessions"))?;
        Ok(Self {
            sessions_dir,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_CACHED_SESSIONS).expect("cache size must be > 0"),
            )),
        })
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}.jsonl", safe_filename(id)))
    }

    fn load(&self, id: &str) -> Result<Option<Session>> {
        let path = self.session_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read session file {}", path.display()))?;

        let mut session = Session {
            id: id.to_string(),
            ..Session::new()
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(data) = serde_json::from_str::<Value>(line) else {
                warn!("skipping unparseable session line in {}", path.display());
                continue;
            };
            match data.get("_type").and_then(Value::as_str) {
                Some("meta") => {
                    if let Some(ts) = data.get("createdAt").and_then(Value::as_str) {
                        if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
                            session.created_at = dt.with_timezone(&Utc);
                        }
                    }
                    if let Some(ts) = data.get("updatedAt").and_then(Value::as_str) {
                        if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
                            session.updated_at = dt.with_timezone(&Utc);
                        }
                    }
                    if let Some(grants) = data.get("grantedApprovals").and_then(Value::as_array) {
                        session.granted_approvals = grants
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect();
                    }
                    if let Some(usage) = data.get("totalUsage") {
                        if let Ok(usage) = serde_json::from_value::<Usage>(usage.clone()) {
                            session.total_usage = usage;
                        }
                    }
                    if let Some(cost) = data.get("estimatedCost").and_then(Value::as_f64) {
                        session.estimated_cost = cost;
                    }
                }
                Some("msg") => {
                    if let Some(msg) = data.get("message") {
                        match serde_json::from_value::<ConversationMessage>(msg.clone()) {
                            Ok(msg) => session.messages.push(msg),
                            Err(e) => warn!("skipping bad message line: {}", e),
                        }
                    }
                }
                Some("turn") => {
                    if let Some(turn) = data.get("turn") {
                        match serde_json::from_value::<Turn>(turn.clone()) {
                            Ok(turn) => session.turns.push(turn),
                            Err(e) => warn!("skipping bad turn line: {}", e),
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(Some(session))
    }

    fn write(&self, session: &Session) -> Result<()> {
        let path = self.session_path(&session.id);
        let mut content = String::new();

        let meta = serde_json::json!({
            "_type": "meta",
            "id": session.id,
            "createdAt": session.created_at.to_rfc3339(),
            "updatedAt": session.updated_at.to_rfc3339(),
            "grantedApprovals": session.granted_approvals.iter().collect::<Vec<_>>(),
            "totalUsage": session.total_usage,
            "estimatedCost": session.estimated_cost,
        });
        content.push_str(&serde_json::to_string(&meta)?);
        content.push('\n');

        for msg in &session.messages {
            let line = serde_json::json!({"_type": "msg", "message": msg});
            content.push_str(&serde_json::to_string(&line)?);
            content.push('\n');
        }
        for turn in &session.turns {
            let line = serde_json::json!({"_type": "turn", "turn": turn});
            content.push_str(&serde_json::to_string(&line)?);
            content.push('\n');
        }

        atomic_write(&path, &content)
            .with_context(|| format!("Failed to write session file {}", path.display()))
    }

    /// Delete session files not updated within `ttl_days`.
    pub fn cleanup_old_sessions(&self, ttl_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(ttl_days));
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "jsonl") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let modified: DateTime<Utc> = modified.into();
            if modified < cutoff {
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl SessionStore for SessionManager {
    async fn create(&self) -> Result<Session> {
        let session = Session::new();
        self.write(&session)?;
        let mut cache = self.cache.lock().await;
        cache.put(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(session) = cache.get(id) {
                return Ok(Some(session.clone()));
            }
        }
        let Some(session) = self.load(id)? else {
            return Ok(None);
        };
        let mut cache = self.cache.lock().await;
        cache.put(id.to_string(), session.clone());
        Ok(Some(session))
    }

    async fn save(&self, session: &Session) -> Result<()> {
        self.write(session)?;
        let mut cache = self.cache.lock().await;
        cache.put(session.id.clone(), session.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "jsonl") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(session) = self.load(id)? {
                summaries.push(SessionSummary {
                    id: session.id,
                    created_at: session.created_at,
                    updated_at: session.updated_at,
                    message_count: session.messages.len(),
                });
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}
