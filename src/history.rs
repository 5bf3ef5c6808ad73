//! Upload history store
//!
//! Structured record of every batch-upload invocation: one `UploadSession`
//! per batch, one `UploadItem` per file outcome. Sessions are kept
//! most-recent-first and bounded; the oldest session is dropped on overflow
//! (FIFO - sessions are never "accessed" in a way that should extend their
//! life). All writes are append-or-no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::config::AgentRole;
use crate::storage::{KeyValueStore, StorageError};

const HISTORY_KEY: &str = "upload_history";

/// Terminal-state-or-pending status for a single upload attempt.
///
/// A tagged variant instead of optional fields, so a "success with an error
/// message" cannot exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Success { duration_ms: u64 },
    Error { message: String, retries: u32 },
}

impl UploadStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, UploadStatus::Pending)
    }
}

/// Outcome record for one file in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadItem {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub agent_role: AgentRole,
    #[serde(flatten)]
    pub status: UploadStatus,
    pub started_at: DateTime<Utc>,
}

impl UploadItem {
    pub fn new(file_name: &str, file_size: u64, mime_type: &str, agent_role: AgentRole) -> Self {
        Self {
            id: format!("item_{}", Uuid::new_v4()),
            file_name: file_name.to_string(),
            file_size,
            mime_type: mime_type.to_string(),
            agent_role,
            status: UploadStatus::Pending,
            started_at: Utc::now(),
        }
    }
}

/// One invocation of the batch-upload operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub agent_role: AgentRole,
    pub total_files: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub items: Vec<UploadItem>,
}

impl UploadSession {
    pub fn new(agent_role: AgentRole, total_files: usize) -> Self {
        Self {
            id: format!("session_{}", Uuid::new_v4()),
            started_at: Utc::now(),
            agent_role,
            total_files,
            success_count: 0,
            error_count: 0,
            items: Vec::new(),
        }
    }
}

/// Per-agent aggregate over all retained sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStats {
    pub total: usize,
    pub success: usize,
    pub error: usize,
}

/// Append-only history of upload sessions over durable key-value storage.
pub struct UploadHistory {
    store: Arc<dyn KeyValueStore>,
    max_sessions: usize,
}

impl UploadHistory {
    pub fn new(store: Arc<dyn KeyValueStore>, max_sessions: usize) -> Self {
        Self { store, max_sessions }
    }

    fn load(&self) -> Vec<UploadSession> {
        match self.store.get(HISTORY_KEY) {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(sessions) => sessions,
                Err(e) => {
                    warn!("Failed to parse upload history, starting fresh: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read upload history: {}", e);
                Vec::new()
            }
        }
    }

    fn save(&self, sessions: &[UploadSession]) -> Result<(), StorageError> {
        let json = serde_json::to_string(sessions)
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
        self.store.set(HISTORY_KEY, &json)
    }

    /// Insert a new session at the front, evicting the oldest past the
    /// retention bound.
    pub fn create_session(&self, session: UploadSession) -> Result<(), StorageError> {
        let mut sessions = self.load();
        sessions.insert(0, session);
        sessions.truncate(self.max_sessions);
        self.save(&sessions)
    }

    /// Append a settled item to a session, updating the derived counts in the
    /// same write. An unknown session id is logged and ignored: history
    /// bookkeeping must never fail the upload itself.
    pub fn append_item(&self, session_id: &str, item: UploadItem) -> Result<(), StorageError> {
        let mut sessions = self.load();
        let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) else {
            warn!("append_item for unknown session {}, dropping record", session_id);
            return Ok(());
        };

        match &item.status {
            UploadStatus::Success { .. } => session.success_count += 1,
            UploadStatus::Error { .. } => session.error_count += 1,
            UploadStatus::Pending => {}
        }
        session.items.push(item);
        session.total_files = session.items.len().max(session.total_files);

        self.save(&sessions)
    }

    /// All retained sessions, most recent first.
    pub fn list_sessions(&self) -> Vec<UploadSession> {
        self.load()
    }

    pub fn get_session(&self, session_id: &str) -> Option<UploadSession> {
        self.load().into_iter().find(|s| s.id == session_id)
    }

    /// Most recent error items across all sessions.
    pub fn recent_errors(&self, limit: usize) -> Vec<UploadItem> {
        let mut errors: Vec<UploadItem> = self
            .load()
            .into_iter()
            .flat_map(|s| s.items)
            .filter(|i| matches!(i.status, UploadStatus::Error { .. }))
            .collect();
        errors.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        errors.truncate(limit);
        errors
    }

    /// Per-agent totals, recomputed on demand.
    pub fn stats_by_agent(&self) -> HashMap<AgentRole, AgentStats> {
        let mut stats: HashMap<AgentRole, AgentStats> = HashMap::new();
        for session in self.load() {
            let entry = stats.entry(session.agent_role).or_default();
            entry.total += session.total_files;
            entry.success += session.success_count;
            entry.error += session.error_count;
        }
        stats
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.store.remove(HISTORY_KEY)
    }

    pub fn remove_session(&self, session_id: &str) -> Result<(), StorageError> {
        let mut sessions = self.load();
        sessions.retain(|s| s.id != session_id);
        self.save(&sessions)
    }
}

/// Human-readable file size (1024-based).
pub fn format_file_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Human-readable duration: ms under a second, seconds under a minute.
pub fn format_duration(milliseconds: u64) -> String {
    if milliseconds < 1000 {
        return format!("{}ms", milliseconds);
    }
    let seconds = milliseconds as f64 / 1000.0;
    if seconds < 60.0 {
        return format!("{:.1}s", seconds);
    }
    format!("{:.1}min", seconds / 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn history(max: usize) -> UploadHistory {
        UploadHistory::new(Arc::new(MemoryStore::new()), max)
    }

    fn settled_item(role: AgentRole, status: UploadStatus) -> UploadItem {
        let mut item = UploadItem::new("contract.pdf", 1234, "application/pdf", role);
        item.status = status;
        item
    }

    #[test]
    fn test_fifo_eviction() {
        let history = history(20);
        let mut ids = Vec::new();
        for _ in 0..21 {
            let session = UploadSession::new(AgentRole::General, 1);
            ids.push(session.id.clone());
            history.create_session(session).unwrap();
        }

        let sessions = history.list_sessions();
        assert_eq!(sessions.len(), 20);
        // Most recent first, the very first session was evicted
        assert_eq!(sessions[0].id, ids[20]);
        assert!(!sessions.iter().any(|s| s.id == ids[0]));
    }

    #[test]
    fn test_append_updates_counts_atomically() {
        let history = history(20);
        let session = UploadSession::new(AgentRole::Contracts, 2);
        let id = session.id.clone();
        history.create_session(session).unwrap();

        history
            .append_item(&id, settled_item(AgentRole::Contracts, UploadStatus::Success { duration_ms: 42 }))
            .unwrap();
        history
            .append_item(
                &id,
                settled_item(
                    AgentRole::Contracts,
                    UploadStatus::Error { message: "file type not allowed".to_string(), retries: 0 },
                ),
            )
            .unwrap();

        let session = history.get_session(&id).unwrap();
        assert_eq!(session.success_count, 1);
        assert_eq!(session.error_count, 1);
        let settled = session.items.iter().filter(|i| i.status.is_settled()).count();
        assert_eq!(session.success_count + session.error_count, settled);
        assert_eq!(session.total_files, session.items.len());
    }

    #[test]
    fn test_append_unknown_session_is_noop() {
        let history = history(20);
        let result = history.append_item(
            "session_missing",
            settled_item(AgentRole::General, UploadStatus::Success { duration_ms: 1 }),
        );
        assert!(result.is_ok());
        assert!(history.list_sessions().is_empty());
    }

    #[test]
    fn test_stats_by_agent() {
        let history = history(20);
        let session = UploadSession::new(AgentRole::Labor, 2);
        let id = session.id.clone();
        history.create_session(session).unwrap();
        history
            .append_item(&id, settled_item(AgentRole::Labor, UploadStatus::Success { duration_ms: 5 }))
            .unwrap();
        history
            .append_item(
                &id,
                settled_item(AgentRole::Labor, UploadStatus::Error { message: "x".to_string(), retries: 2 }),
            )
            .unwrap();

        let stats = history.stats_by_agent();
        let labor = stats.get(&AgentRole::Labor).copied().unwrap();
        assert_eq!(labor, AgentStats { total: 2, success: 1, error: 1 });
        assert!(!stats.contains_key(&AgentRole::General));
    }

    #[test]
    fn test_remove_and_clear() {
        let history = history(20);
        let a = UploadSession::new(AgentRole::General, 0);
        let a_id = a.id.clone();
        let b = UploadSession::new(AgentRole::General, 0);
        history.create_session(a).unwrap();
        history.create_session(b).unwrap();

        history.remove_session(&a_id).unwrap();
        assert_eq!(history.list_sessions().len(), 1);

        history.clear().unwrap();
        assert!(history.list_sessions().is_empty());
    }

    #[test]
    fn test_recent_errors_sorted() {
        let history = history(20);
        let session = UploadSession::new(AgentRole::General, 3);
        let id = session.id.clone();
        history.create_session(session).unwrap();

        let mut older = settled_item(
            AgentRole::General,
            UploadStatus::Error { message: "first".to_string(), retries: 0 },
        );
        older.started_at = Utc::now() - chrono::Duration::seconds(60);
        let newer = settled_item(
            AgentRole::General,
            UploadStatus::Error { message: "second".to_string(), retries: 0 },
        );
        history.append_item(&id, older).unwrap();
        history.append_item(&id, newer).unwrap();
        history
            .append_item(&id, settled_item(AgentRole::General, UploadStatus::Success { duration_ms: 1 }))
            .unwrap();

        let errors = history.recent_errors(10);
        assert_eq!(errors.len(), 2);
        assert!(matches!(&errors[0].status, UploadStatus::Error { message, .. } if message == "second"));
    }

    #[test]
    fn test_status_serde_tagged() {
        let item = settled_item(AgentRole::General, UploadStatus::Success { duration_ms: 99 });
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["duration_ms"], 99);
        assert!(json.get("message").is_none());

        let back: UploadItem = serde_json::from_value(json).unwrap();
        assert_eq!(back.status, UploadStatus::Success { duration_ms: 99 });
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(2048), "2.00 KB");
        assert_eq!(format_file_size(50 * 1024 * 1024), "50.00 MB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(250), "250ms");
        assert_eq!(format_duration(1500), "1.5s");
        assert_eq!(format_duration(90_000), "1.5min");
    }
}
