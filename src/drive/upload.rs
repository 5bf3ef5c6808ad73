//! Batch upload orchestrator
//!
//! Drives a batch of local files into an agent's Drive subfolder with
//! bounded concurrency and per-file error isolation. Files run in groups of
//! `max_concurrent`; a group must fully settle before the next starts. One
//! file failing never aborts its siblings, with a single exception: a size
//! violation anywhere rejects the whole batch before any network traffic.

use base64::Engine;
use futures_util::future::join_all;
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::folders::FolderResolver;
use super::token::TokenProvider;
use super::transport::DriveTransport;
use super::types::{classify_message, DriveError, FileDescriptor};
use crate::config::{AgentConfig, AgentRole, UploadConfig};
use crate::history::{UploadHistory, UploadItem, UploadSession, UploadStatus};
use crate::storage::StorageError;

/// Whole-batch failures. Per-file failures never surface here; they are
/// recorded as error items inside the returned session.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Not authenticated with the storage provider")]
    NotAuthenticated,

    /// One or more files exceed the size limit; nothing was uploaded.
    #[error("Files exceed the size limit: {}", .0.join(", "))]
    FilesTooLarge(Vec<String>),

    #[error("Could not resolve destination folder: {0}")]
    FolderResolution(DriveError),

    #[error("History error: {0}")]
    History(#[from] StorageError),
}

pub struct Uploader {
    transport: Arc<dyn DriveTransport>,
    tokens: Arc<dyn TokenProvider>,
    history: Arc<UploadHistory>,
    config: UploadConfig,
}

impl Uploader {
    pub fn new(
        transport: Arc<dyn DriveTransport>,
        tokens: Arc<dyn TokenProvider>,
        history: Arc<UploadHistory>,
        config: UploadConfig,
    ) -> Self {
        Self { transport, tokens, history, config }
    }

    /// Upload a batch of files into the agent's subfolder. Returns the
    /// session record with one settled item per file. Already-settled files
    /// keep their outcome when a later file cancels or expires the session.
    pub async fn upload_batch(
        &self,
        role: AgentRole,
        agent: &AgentConfig,
        files: Vec<FileDescriptor>,
        cancel: &CancellationToken,
    ) -> Result<UploadSession, UploadError> {
        if !self.tokens.is_authenticated() {
            return Err(UploadError::NotAuthenticated);
        }

        let oversized: Vec<String> = files
            .iter()
            .filter(|f| f.size > self.config.max_file_size)
            .map(|f| f.file_name.clone())
            .collect();
        if !oversized.is_empty() {
            return Err(UploadError::FilesTooLarge(oversized));
        }

        let resolver = FolderResolver::new(self.transport.clone(), self.tokens.clone());
        let folder_id = resolver
            .resolve(&agent.drive_root_folder_id, &agent.subfolder_name)
            .await
            .map_err(UploadError::FolderResolution)?;

        let mut session = UploadSession::new(role, files.len());
        self.history.create_session(session.clone())?;
        info!(
            "Upload session {} started: {} file(s) for {}",
            session.id,
            files.len(),
            role.as_key()
        );

        let mut settled: Vec<UploadItem> = Vec::with_capacity(files.len());
        let mut remaining = files.as_slice();

        while !remaining.is_empty() {
            if cancel.is_cancelled() {
                for file in remaining {
                    let mut item =
                        UploadItem::new(&file.file_name, file.size, &file.mime_type, role);
                    item.status =
                        UploadStatus::Error { message: "cancelled".to_string(), retries: 0 };
                    self.record(&session.id, &item);
                    settled.push(item);
                }
                break;
            }

            let group_size = self.config.max_concurrent.max(1).min(remaining.len());
            let (group, rest) = remaining.split_at(group_size);
            remaining = rest;

            let outcomes = join_all(
                group
                    .iter()
                    .map(|file| self.upload_one(role, &folder_id, file, cancel)),
            )
            .await;

            for item in outcomes {
                self.record(&session.id, &item);
                settled.push(item);
            }
        }

        session.success_count = settled
            .iter()
            .filter(|i| matches!(i.status, UploadStatus::Success { .. }))
            .count();
        session.error_count = settled
            .iter()
            .filter(|i| matches!(i.status, UploadStatus::Error { .. }))
            .count();
        session.items = settled;

        info!(
            "Upload session {} finished: {} ok, {} failed",
            session.id, session.success_count, session.error_count
        );
        Ok(session)
    }

    /// History bookkeeping never fails an upload.
    fn record(&self, session_id: &str, item: &UploadItem) {
        if let Err(e) = self.history.append_item(session_id, item.clone()) {
            warn!("Failed to record upload item {}: {}", item.id, e);
        }
    }

    /// Upload one file and return its settled item. A 401 gets exactly one
    /// refresh-and-retry; a second 401 clears the credential. Transient
    /// failures back off 1s, 2s, 4s... up to `max_server_retries` extra
    /// attempts.
    async fn upload_one(
        &self,
        role: AgentRole,
        folder_id: &str,
        file: &FileDescriptor,
        cancel: &CancellationToken,
    ) -> UploadItem {
        let mut item = UploadItem::new(&file.file_name, file.size, &file.mime_type, role);
        let started = Instant::now();

        let outcome = self.attempt_loop(folder_id, file, cancel).await;

        item.status = match outcome {
            Ok(file_id) => {
                debug!("Uploaded {} as {}", file.file_name, file_id);
                UploadStatus::Success { duration_ms: started.elapsed().as_millis() as u64 }
            }
            Err((error, retries)) => {
                warn!("Upload of {} failed: {}", file.file_name, error);
                UploadStatus::Error { message: classify_message(&error), retries }
            }
        };
        item
    }

    async fn attempt_loop(
        &self,
        folder_id: &str,
        file: &FileDescriptor,
        cancel: &CancellationToken,
    ) -> Result<String, (DriveError, u32)> {
        if !self.config.is_mime_allowed(&file.mime_type) {
            return Err((DriveError::TypeNotAllowed(file.mime_type.clone()), 0));
        }

        let bytes = tokio::fs::read(&file.path)
            .await
            .map_err(|e| (DriveError::Other(format!("Cannot read file: {}", e)), 0))?;
        let content_b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);

        let mut refreshed = false;
        let mut server_retries: u32 = 0;
        let mut retries: u32 = 0;

        loop {
            let token = match self.tokens.access_token().await {
                Ok(token) => token,
                Err(e) => return Err((e, retries)),
            };

            let result = self
                .transport
                .upload_file(
                    token.expose_secret(),
                    folder_id,
                    &file.file_name,
                    &file.mime_type,
                    &content_b64,
                )
                .await;

            match result {
                Ok(file_id) => return Ok(file_id),
                Err(DriveError::Unauthorized) => {
                    if refreshed || !self.tokens.refresh().await {
                        self.tokens.logout();
                        return Err((DriveError::SessionExpired, retries));
                    }
                    refreshed = true;
                    retries += 1;
                }
                Err(e) if e.is_transient() && server_retries < self.config.max_server_retries => {
                    // Exponent clamped so an oversized retry config cannot
                    // overflow the shift
                    let delay = Duration::from_secs(1 << server_retries.min(6));
                    debug!(
                        "Transient failure uploading {}, retrying in {:?}: {}",
                        file.file_name, delay, e
                    );
                    server_retries += 1;
                    retries += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err((DriveError::Cancelled, retries)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err((e, retries)),
            }
        }
    }
}
