//! Remote file management
//!
//! List and delete operations over files already uploaded to an agent's
//! folder. Same credential rules as the upload path: a 401 gets exactly one
//! refresh-and-retry, a second auth failure clears the credential and
//! reports the session expired.

use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{debug, info};

use super::token::TokenProvider;
use super::transport::DriveTransport;
use super::types::{DriveError, RemoteFile};

pub struct FileManager {
    transport: Arc<dyn DriveTransport>,
    tokens: Arc<dyn TokenProvider>,
}

impl FileManager {
    pub fn new(transport: Arc<dyn DriveTransport>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self { transport, tokens }
    }

    /// Files in `folder_id`, newest first, at most `max_results`.
    pub async fn list(
        &self,
        folder_id: &str,
        max_results: u32,
    ) -> Result<Vec<RemoteFile>, DriveError> {
        let mut refreshed = false;
        loop {
            let token = self.tokens.access_token().await?;
            match self
                .transport
                .list_files(token.expose_secret(), folder_id, max_results)
                .await
            {
                Ok(files) => {
                    debug!("Listed {} file(s) in {}", files.len(), folder_id);
                    return Ok(files);
                }
                Err(DriveError::Unauthorized) => {
                    if refreshed || !self.tokens.refresh().await {
                        self.tokens.logout();
                        return Err(DriveError::SessionExpired);
                    }
                    refreshed = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Permanently delete a file by id.
    pub async fn delete(&self, file_id: &str) -> Result<(), DriveError> {
        let mut refreshed = false;
        loop {
            let token = self.tokens.access_token().await?;
            match self
                .transport
                .delete_file(token.expose_secret(), file_id)
                .await
            {
                Ok(()) => {
                    info!("Deleted remote file {}", file_id);
                    return Ok(());
                }
                Err(DriveError::Unauthorized) => {
                    if refreshed || !self.tokens.refresh().await {
                        self.tokens.logout();
                        return Err(DriveError::SessionExpired);
                    }
                    refreshed = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
