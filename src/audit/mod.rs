use crate::security::secrets::{RedactOptions, SecretDetector};
use crate::utils::ensure_dir;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Field names that must never reach the audit journal, stripped recursively
/// from metadata before persistence (both naming conventions).
const FORBIDDEN_FIELDS: &[&str] = &[
    "content",
    "arguments",
    "output",
    "file_content",
    "fileContent",
    "memory_content",
    "memoryContent",
    "response_text",
    "responseText",
    "raw_input",
    "rawInput",
];

/// Keys whose string values are error messages: redacted then truncated.
const ERROR_FIELDS: &[&str] = &["error", "error_message", "errorMessage", "reason"];

const MAX_ERROR_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditCategory {
    Session,
    Turn,
    Tool,
    Approval,
    Network,
    Sandbox,
    Provider,
    Security,
    Memory,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// One journal record. `metadata` is sanitized before the entry is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    pub action: String,
    pub severity: AuditSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Query filter for reading back journal entries.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub category: Option<AuditCategory>,
    pub action: Option<String>,
    pub min_severity: Option<AuditSeverity>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Event draft passed to [`AuditLogger::log`]. Kept separate from
/// [`AuditEntry`] so id/timestamp assignment and sanitization happen in
/// exactly one place.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub category: AuditCategory,
    pub action: String,
    pub severity: AuditSeverity,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub metadata: Value,
}

impl AuditEvent {
    pub fn new(
        category: AuditCategory,
        action: impl Into<String>,
        severity: AuditSeverity,
    ) -> Self {
        Self {
            category,
            action: action.into(),
            severity,
            request_id: None,
            session_id: None,
            user_id: None,
            metadata: Value::Object(Map::new()),
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.metadata {
            map.insert(key.to_string(), value.into());
        }
        self
    }
}

/// Append-only redacted event journal. One JSON record per line, one file
/// per day, created 0600. All writes pass through sanitization — there is
/// no way to persist metadata without it.
pub struct AuditLogger {
    dir: PathBuf,
    detector: Arc<SecretDetector>,
    // Serializes appends so concurrent sessions never interleave lines
    write_lock: Mutex<()>,
}

impl AuditLogger {
    pub fn new(dir: PathBuf, detector: Arc<SecretDetector>) -> Result<Self> {
        ensure_dir(&dir)?;
        Ok(Self {
            dir,
            detector,
            write_lock: Mutex::new(()),
        })
    }

    fn journal_path(&self, date: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("audit-{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Sanitize and append one event. Never fails the caller's operation on
    /// redaction; IO errors propagate.
    pub fn log(&self, event: AuditEvent) -> Result<AuditEntry> {
        let entry = AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            category: event.category,
            action: event.action,
            severity: event.severity,
            request_id: event.request_id,
            session_id: event.session_id,
            user_id: event.user_id,
            metadata: self.sanitize_metadata(event.metadata),
        };

        let line = serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
        let path = self.journal_path(entry.timestamp);

        let _guard = self.write_lock.lock().expect("audit lock poisoned");
        let mut file = open_append(&path)?;
        writeln!(file, "{}", line)
            .with_context(|| format!("Failed to append audit entry to {}", path.display()))?;
        Ok(entry)
    }

    /// Convenience for the common info-level case.
    pub fn info(&self, category: AuditCategory, action: &str) -> Result<AuditEntry> {
        self.log(AuditEvent::new(category, action, AuditSeverity::Info))
    }

    /// Recursively strip forbidden fields and redact error strings.
    fn sanitize_metadata(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, v) in map {
                    if FORBIDDEN_FIELDS.contains(&key.as_str()) {
                        continue;
                    }
                    if ERROR_FIELDS.contains(&key.as_str()) {
                        if let Value::String(s) = &v {
                            let redacted = self.detector.redact(s, &RedactOptions::default());
                            out.insert(
                                key,
                                Value::String(crate::utils::truncate_chars(
                                    &redacted,
                                    MAX_ERROR_CHARS,
                                    "…",
                                )),
                            );
                            continue;
                        }
                    }
                    out.insert(key, self.sanitize_metadata(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|v| self.sanitize_metadata(v))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Read back entries matching the filter, oldest first. Unparseable
    /// lines are skipped (a torn final line after a crash must not poison
    /// the whole journal).
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|e| e == "jsonl")
                    && p.file_name()
                        .and_then(|f| f.to_str())
                        .is_some_and(|f| f.starts_with("audit-"))
            })
            .collect();
        files.sort();

        let mut entries = Vec::new();
        for path in files {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read journal {}", path.display()))?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(entry) = serde_json::from_str::<AuditEntry>(line) else {
                    continue;
                };
                if Self::matches(&entry, query) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    fn matches(entry: &AuditEntry, query: &AuditQuery) -> bool {
        if let Some(category) = query.category {
            if entry.category != category {
                return false;
            }
        }
        if let Some(action) = &query.action {
            if &entry.action != action {
                return false;
            }
        }
        if let Some(min) = query.min_severity {
            if entry.severity < min {
                return false;
            }
        }
        if let Some(since) = query.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = query.until {
            if entry.timestamp > until {
                return false;
            }
        }
        true
    }
}

#[cfg(unix)]
fn open_append(path: &std::path::Path) -> Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to open journal {}", path.display()))
}

#[cfg(not(unix))]
fn open_append(path: &std::path::Path) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open journal {}", path.display()))
}
