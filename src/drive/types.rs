//! Shared types for the Drive upload core

use std::path::PathBuf;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors raised by the storage-provider client.
#[derive(Debug, Error)]
pub enum DriveError {
    #[error("Not authenticated with the storage provider")]
    NotAuthenticated,

    /// Refresh failed after a confirmed 401; the credential has been cleared.
    #[error("Session expired - please reconnect")]
    SessionExpired,

    #[error("Authorization cancelled")]
    UserCancelled,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Raw 401 from a provider call; handled by the refresh-and-retry loops.
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Server error: HTTP {0}")]
    Server(u16),

    #[error("Request rejected: HTTP {0}: {1}")]
    Request(u16, String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid root container: {0}")]
    InvalidRootContainer(String),

    #[error("File too large: {0}")]
    FileTooLarge(String),

    #[error("File type not allowed: {0}")]
    TypeNotAllowed(String),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Other(String),
}

impl DriveError {
    /// Transient failures are retried with bounded backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, DriveError::Server(_) | DriveError::Network(_))
    }
}

/// Classify an attempt error into the stable short message recorded in
/// history and shown to the user. Unknown errors pass through verbatim;
/// raw provider bodies never reach this point.
pub fn classify_message(error: &DriveError) -> String {
    match error {
        DriveError::TypeNotAllowed(_) => "file type not allowed".to_string(),
        DriveError::FileTooLarge(_) => "file too large".to_string(),
        DriveError::SessionExpired
        | DriveError::Unauthorized
        | DriveError::NotAuthenticated
        | DriveError::AuthenticationFailed(_) => "session expired".to_string(),
        DriveError::Cancelled => "cancelled".to_string(),
        other => other.to_string(),
    }
}

/// A file already stored in a provider folder.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// Absent for provider-native documents, which report no byte size.
    pub size: Option<u64>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A local file queued for upload.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
}

impl FileDescriptor {
    /// Build a descriptor from a path on disk, guessing the MIME type from
    /// the extension.
    pub fn from_path(path: PathBuf) -> Result<Self, DriveError> {
        let metadata = std::fs::metadata(&path)
            .map_err(|e| DriveError::Other(format!("Cannot stat {}: {}", path.display(), e)))?;
        if !metadata.is_file() {
            return Err(DriveError::Other(format!("Not a file: {}", path.display())));
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DriveError::Other(format!("Invalid file name: {}", path.display())))?
            .to_string();
        let mime_type = mime_guess::from_path(&path).first_or_octet_stream().to_string();
        Ok(Self { path, file_name, mime_type, size: metadata.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transient() {
        assert!(DriveError::Server(503).is_transient());
        assert!(DriveError::Network("reset".to_string()).is_transient());
        assert!(!DriveError::Unauthorized.is_transient());
        assert!(!DriveError::Request(404, "gone".to_string()).is_transient());
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(
            classify_message(&DriveError::TypeNotAllowed("application/zip".to_string())),
            "file type not allowed"
        );
        assert_eq!(classify_message(&DriveError::FileTooLarge("big.pdf".to_string())), "file too large");
        assert_eq!(classify_message(&DriveError::SessionExpired), "session expired");
        assert_eq!(classify_message(&DriveError::Cancelled), "cancelled");
        // Unknown errors pass through their message
        assert_eq!(
            classify_message(&DriveError::Network("connection reset".to_string())),
            "Network error: connection reset"
        );
    }

    #[test]
    fn test_descriptor_from_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("brief.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();

        let descriptor = FileDescriptor::from_path(path).unwrap();
        assert_eq!(descriptor.file_name, "brief.pdf");
        assert_eq!(descriptor.mime_type, "application/pdf");
        assert_eq!(descriptor.size, 8);

        assert!(FileDescriptor::from_path(tmp.path().to_path_buf()).is_err());
    }
}
