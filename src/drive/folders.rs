//! Idempotent folder resolution
//!
//! Each agent's uploads land in a named subfolder under its configured root
//! container. Resolution is find-then-create: search for the folder first,
//! create it only when absent, so repeated batches reuse one folder instead
//! of piling up duplicates.

use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::token::TokenProvider;
use super::transport::DriveTransport;
use super::types::DriveError;

/// Total attempts at resolution, counting the first. A 401 burns one
/// attempt per refresh-and-retry cycle.
const MAX_ATTEMPTS: u32 = 3;

pub struct FolderResolver {
    transport: Arc<dyn DriveTransport>,
    tokens: Arc<dyn TokenProvider>,
}

impl FolderResolver {
    pub fn new(transport: Arc<dyn DriveTransport>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self { transport, tokens }
    }

    /// Resolve `name` under `root_id`, creating it when absent. Returns the
    /// folder id. On a 401 the credential is refreshed once per attempt;
    /// exhausting the attempt budget clears the credential and reports the
    /// session expired.
    pub async fn resolve(&self, root_id: &str, name: &str) -> Result<String, DriveError> {
        if root_id.trim().is_empty() {
            return Err(DriveError::InvalidRootContainer(
                "No root folder configured".to_string(),
            ));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            if attempt > MAX_ATTEMPTS {
                warn!("Folder resolution attempts exhausted, clearing credential");
                self.tokens.logout();
                return Err(DriveError::SessionExpired);
            }

            let token = self.tokens.access_token().await?;

            match self
                .transport
                .find_folder(token.expose_secret(), root_id, name)
                .await
            {
                Ok(Some(folder_id)) => {
                    debug!("Found existing folder '{}' ({})", name, folder_id);
                    return Ok(folder_id);
                }
                Ok(None) => {}
                Err(DriveError::Unauthorized) => {
                    if !self.tokens.refresh().await {
                        self.tokens.logout();
                        return Err(DriveError::SessionExpired);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }

            match self
                .transport
                .create_folder(token.expose_secret(), root_id, name)
                .await
            {
                Ok(folder_id) => {
                    info!("Created folder '{}' ({})", name, folder_id);
                    return Ok(folder_id);
                }
                Err(DriveError::Unauthorized) => {
                    if !self.tokens.refresh().await {
                        self.tokens.logout();
                        return Err(DriveError::SessionExpired);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
