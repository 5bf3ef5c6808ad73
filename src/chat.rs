//! Chat webhook client and chat-session metadata
//!
//! Each agent role is backed by a workflow webhook that answers a chat
//! message. The webhook is a black box returning text in one of three shapes:
//! `{"output": "..."}`, an array whose first element carries `output`, or a
//! bare JSON string. Session transcripts live server-side; the client only
//! keeps lightweight session metadata locally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::{KeyValueStore, StorageError};

const SESSIONS_KEY: &str = "chat_sessions";
const CURRENT_SESSION_KEY: &str = "current_session_id";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Webhook request failed: {0}")]
    Request(String),

    #[error("Webhook returned HTTP {0}")]
    Status(u16),

    #[error("Unrecognized webhook response shape")]
    UnrecognizedResponse,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    /// Field consumed by the AI agent node.
    #[serde(rename = "chatInput")]
    chat_input: &'a str,
    /// Duplicate for older workflow revisions.
    message: &'a str,
    #[serde(rename = "sessionId")]
    session_id: &'a str,
}

/// Client for the per-agent workflow webhooks.
pub struct ChatClient {
    client: reqwest::Client,
}

impl ChatClient {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    /// Send a chat message and return the agent's reply text.
    pub async fn send(
        &self,
        webhook_url: &str,
        message: &str,
        session_id: &str,
    ) -> Result<String, ChatError> {
        let payload = WebhookPayload {
            chat_input: message,
            message,
            session_id,
        };

        let response = self
            .client
            .post(webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ChatError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::Status(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ChatError::Request(format!("Invalid JSON response: {}", e)))?;

        debug!("Webhook reply received ({} bytes-ish)", body.to_string().len());
        parse_reply(&body)
    }
}

impl Default for ChatClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the reply text from any of the accepted response shapes.
fn parse_reply(body: &Value) -> Result<String, ChatError> {
    if let Some(array) = body.as_array() {
        if let Some(output) = array.first().and_then(|v| v.get("output")).and_then(Value::as_str) {
            return Ok(output.to_string());
        }
    }
    if let Some(text) = body.as_str() {
        return Ok(text.to_string());
    }
    if let Some(output) = body.get("output").and_then(Value::as_str) {
        return Ok(output.to_string());
    }
    Err(ChatError::UnrecognizedResponse)
}

/// Lightweight local metadata for one chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_message: String,
    pub message_count: u32,
}

/// Chat-session metadata over durable key-value storage, plus the
/// current-session pointer.
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn load(&self) -> Vec<ChatSession> {
        match self.store.get(SESSIONS_KEY) {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("Failed to parse chat sessions, starting fresh: {}", e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read chat sessions: {}", e);
                Vec::new()
            }
        }
    }

    fn save(&self, sessions: &[ChatSession]) -> Result<(), StorageError> {
        let json = serde_json::to_string(sessions)
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
        self.store.set(SESSIONS_KEY, &json)
    }

    /// Create a session (named after the first message when present) and
    /// make it current.
    pub fn create_session(&self, first_message: Option<&str>) -> Result<ChatSession, StorageError> {
        let session = ChatSession {
            id: Uuid::new_v4().to_string(),
            name: first_message.map(session_name).unwrap_or_else(|| "New conversation".to_string()),
            created_at: Utc::now(),
            last_message: first_message.unwrap_or_default().to_string(),
            message_count: u32::from(first_message.is_some()),
        };

        let mut sessions = self.load();
        sessions.insert(0, session.clone());
        self.save(&sessions)?;
        self.set_current(&session.id)?;
        Ok(session)
    }

    pub fn current(&self) -> Option<String> {
        self.store.get(CURRENT_SESSION_KEY).ok().flatten()
    }

    pub fn set_current(&self, session_id: &str) -> Result<(), StorageError> {
        self.store.set(CURRENT_SESSION_KEY, session_id)
    }

    /// Record a new message on a session; names the session after its first
    /// message.
    pub fn update_with_message(&self, session_id: &str, message: &str) -> Result<(), StorageError> {
        let mut sessions = self.load();
        if let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) {
            session.last_message = message.to_string();
            session.message_count += 1;
            if session.message_count == 1 {
                session.name = session_name(message);
            }
            self.save(&sessions)?;
        }
        Ok(())
    }

    /// All sessions, newest first.
    pub fn list(&self) -> Vec<ChatSession> {
        self.load()
    }

    pub fn delete(&self, session_id: &str) -> Result<(), StorageError> {
        let mut sessions = self.load();
        sessions.retain(|s| s.id != session_id);
        self.save(&sessions)?;
        if self.current().as_deref() == Some(session_id) {
            self.store.remove(CURRENT_SESSION_KEY)?;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.store.remove(SESSIONS_KEY)?;
        self.store.remove(CURRENT_SESSION_KEY)
    }
}

/// Session display name: first four words of the message, ellipsis past 30
/// characters.
fn session_name(message: &str) -> String {
    let words: Vec<&str> = message.split_whitespace().take(4).collect();
    let mut name = words.join(" ");
    if message.len() > 30 {
        name.push_str("...");
    }
    name
}
