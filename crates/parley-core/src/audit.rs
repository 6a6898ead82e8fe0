//! Append-only audit trail for chat requests and actions.
//!
//! Records are stored as JSONL at `~/.config/parley/audit.jsonl` (or the
//! configured path). Each line is a self-contained [`AuditRecord`]; query
//! text is masked before it is written and records are never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::error::{ParleyError, Result};
use crate::model::EntityRef;
use crate::scrub::Masker;

/// What kind of request produced the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Query,
    Action,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Action => write!(f, "action"),
        }
    }
}

/// A single audit record. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub request_id: Uuid,
    #[serde(default)]
    pub session_id: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub action: AuditAction,
    pub query_text_masked: String,
    pub result_status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities_accessed: Vec<EntityRef>,
    pub timestamp: DateTime<Utc>,
}

/// Unmasked description of a finished request, handed to [`AuditLogger::record`].
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub request_id: Uuid,
    pub session_id: Option<String>,
    pub user_id: String,
    pub client_id: Option<String>,
    pub action: AuditAction,
    pub query_text: String,
    pub result_status: String,
    pub entities_accessed: Vec<EntityRef>,
}

impl AuditEvent {
    pub fn new(
        request_id: Uuid,
        user_id: impl Into<String>,
        action: AuditAction,
        query_text: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            session_id: None,
            user_id: user_id.into(),
            client_id: None,
            action,
            query_text: query_text.into(),
            result_status: "success".to_string(),
            entities_accessed: Vec::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.result_status = status.into();
        self
    }

    pub fn with_entities(mut self, entities: Vec<EntityRef>) -> Self {
        self.entities_accessed = entities;
        self
    }
}

/// Append-only JSONL audit logger.
pub struct AuditLogger {
    path: PathBuf,
    enabled: bool,
    masker: Masker,
    // Serializes appends so concurrent requests never interleave lines.
    write_lock: Mutex<()>,
}

impl AuditLogger {
    pub fn new(path: PathBuf, enabled: bool, masker: Masker) -> Self {
        Self {
            path,
            enabled,
            masker,
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &AuditConfig, masker: Masker) -> Result<Self> {
        let path = match &config.path {
            Some(p) => PathBuf::from(p),
            None => crate::config::state_dir()?.join("audit.jsonl"),
        };
        Ok(Self::new(path, config.enabled, masker))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Mask and append one record. Write failures are logged and swallowed:
    /// the user-facing request never fails because of the audit trail.
    pub fn record(&self, event: AuditEvent) -> AuditRecord {
        let record = AuditRecord {
            request_id: event.request_id,
            session_id: event.session_id,
            user_id: event.user_id,
            client_id: event.client_id,
            action: event.action,
            query_text_masked: self.masker.mask(&event.query_text),
            result_status: event.result_status,
            entities_accessed: event.entities_accessed,
            timestamp: Utc::now(),
        };

        if self.enabled {
            if let Err(e) = self.append(&record) {
                tracing::warn!(
                    request_id = %record.request_id,
                    "audit: failed to write record: {e}"
                );
            }
        }
        record
    }

    fn append(&self, record: &AuditRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| ParleyError::Storage(format!("audit lock poisoned: {e}")))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ParleyError::Storage(format!("failed to create audit dir: {e}")))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ParleyError::Storage(format!("failed to open audit log: {e}")))?;
        writeln!(file, "{line}")
            .map_err(|e| ParleyError::Storage(format!("failed to append audit record: {e}")))?;
        Ok(())
    }

    /// The N most recent records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let mut records = self.read_all();
        records.reverse();
        records.truncate(limit);
        records
    }

    /// All records for one request id (normally exactly one).
    pub fn for_request(&self, request_id: Uuid) -> Vec<AuditRecord> {
        let mut records = self.read_all();
        records.retain(|r| r.request_id == request_id);
        records
    }

    fn read_all(&self) -> Vec<AuditRecord> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}
