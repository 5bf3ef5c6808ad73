//! LexSync - document sync and chat client for a legal assistant service
//!
//! Core pieces: OAuth token lifecycle for Google Drive, idempotent folder
//! resolution, a bounded-concurrency batch upload orchestrator with retry
//! and error classification, and a durable upload history. Around them:
//! per-agent chat webhooks, Keycloak login, and JSON key-value persistence.

pub mod chat;
pub mod config;
pub mod drive;
pub mod history;
pub mod identity;
pub mod storage;

pub use chat::{ChatClient, ChatSession, SessionStore};
pub use config::{load_config, save_config, AgentConfig, AgentRole, AppConfig, UploadConfig};
pub use drive::{
    DriveError, DriveTransport, FileDescriptor, FileManager, FolderResolver, HttpDriveTransport,
    RemoteFile, TokenManager, TokenProvider, UploadError, Uploader,
};
pub use history::{
    format_duration, format_file_size, AgentStats, UploadHistory, UploadItem, UploadSession,
    UploadStatus,
};
pub use identity::IdentityClient;
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
