//! HTTP transport for the Drive v3 REST API
//!
//! The orchestrator and folder resolver talk to the provider through the
//! `DriveTransport` trait so tests can substitute a fake without network
//! access. The HTTP implementation maps provider status codes onto the
//! `DriveError` taxonomy: 401 is the sole auth-expiry signal, 5xx is
//! transient, 400/404 on folder operations means the configured root
//! container is unusable.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use tracing::{debug, info};

use super::types::{DriveError, RemoteFile};

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_API_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const MULTIPART_BOUNDARY: &str = "lexsync_boundary_314159265358979";

/// Provider operations the upload core depends on.
#[async_trait]
pub trait DriveTransport: Send + Sync {
    /// Find a non-trashed folder with this exact name under the parent.
    /// Returns the first match, if any.
    async fn find_folder(
        &self,
        access_token: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<String>, DriveError>;

    /// Create a folder under the parent and return its id.
    async fn create_folder(
        &self,
        access_token: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<String, DriveError>;

    /// Multipart create-file request; `content_b64` is the base64-encoded
    /// file body. Returns the new file id.
    async fn upload_file(
        &self,
        access_token: &str,
        folder_id: &str,
        file_name: &str,
        mime_type: &str,
        content_b64: &str,
    ) -> Result<String, DriveError>;

    /// Non-trashed files in a folder, newest first, bounded by `max_results`.
    async fn list_files(
        &self,
        access_token: &str,
        folder_id: &str,
        max_results: u32,
    ) -> Result<Vec<RemoteFile>, DriveError>;

    /// Permanently delete a file by id.
    async fn delete_file(&self, access_token: &str, file_id: &str) -> Result<(), DriveError>;
}

#[derive(Debug, Deserialize)]
struct DriveFileId {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFileId>,
}

/// Drive reports `size` as a decimal string and omits it for native docs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileMeta {
    id: String,
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    created_time: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
struct DriveFileMetaList {
    #[serde(default)]
    files: Vec<DriveFileMeta>,
}

impl From<DriveFileMeta> for RemoteFile {
    fn from(meta: DriveFileMeta) -> Self {
        RemoteFile {
            id: meta.id,
            name: meta.name,
            mime_type: meta.mime_type,
            size: meta.size.and_then(|s| s.parse().ok()),
            created_at: meta.created_time,
        }
    }
}

/// Real Drive API v3 client.
pub struct HttpDriveTransport {
    client: reqwest::Client,
}

impl HttpDriveTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {}", token)
    }

    /// Map a non-success response to a DriveError. `folder_op` marks the
    /// search/create calls, where 400/404 indicates a bad root container.
    async fn error_for(response: reqwest::Response, folder_op: bool) -> DriveError {
        let status = response.status().as_u16();
        match status {
            401 => DriveError::Unauthorized,
            500..=599 => DriveError::Server(status),
            400 | 404 if folder_op => {
                let body = response.text().await.unwrap_or_default();
                debug!("Root container rejected: HTTP {}: {}", status, body);
                DriveError::InvalidRootContainer(format!("HTTP {}", status))
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                DriveError::Request(status, body)
            }
        }
    }
}

impl Default for HttpDriveTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriveTransport for HttpDriveTransport {
    async fn find_folder(
        &self,
        access_token: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<String>, DriveError> {
        let query = format!(
            "name='{}' and '{}' in parents and mimeType='{}' and trashed=false",
            name.replace('\'', "\\'"),
            parent_id,
            FOLDER_MIME_TYPE
        );
        let url = format!(
            "{}/files?q={}&fields=files(id,name)",
            DRIVE_API_BASE,
            urlencoding::encode(&query)
        );

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, Self::bearer(access_token))
            .send()
            .await
            .map_err(|e| DriveError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response, true).await);
        }

        let list: DriveFileList = response
            .json()
            .await
            .map_err(|e| DriveError::Parse(e.to_string()))?;

        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_folder(
        &self,
        access_token: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<String, DriveError> {
        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent_id],
        });

        let url = format!("{}/files?fields=id", DRIVE_API_BASE);

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, Self::bearer(access_token))
            .header(CONTENT_TYPE, "application/json")
            .body(metadata.to_string())
            .send()
            .await
            .map_err(|e| DriveError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response, true).await);
        }

        let created: DriveFileId = response
            .json()
            .await
            .map_err(|e| DriveError::Parse(e.to_string()))?;

        info!("Created folder '{}' under {}", name, parent_id);
        Ok(created.id)
    }

    async fn upload_file(
        &self,
        access_token: &str,
        folder_id: &str,
        file_name: &str,
        mime_type: &str,
        content_b64: &str,
    ) -> Result<String, DriveError> {
        let metadata = serde_json::json!({
            "name": file_name,
            "parents": [folder_id],
        });

        let body = build_multipart_body(&metadata.to_string(), mime_type, content_b64);

        let url = format!("{}/files?uploadType=multipart&fields=id", UPLOAD_API_BASE);

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, Self::bearer(access_token))
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary=\"{}\"", MULTIPART_BOUNDARY),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| DriveError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response, false).await);
        }

        let created: DriveFileId = response
            .json()
            .await
            .map_err(|e| DriveError::Parse(e.to_string()))?;

        Ok(created.id)
    }

    async fn list_files(
        &self,
        access_token: &str,
        folder_id: &str,
        max_results: u32,
    ) -> Result<Vec<RemoteFile>, DriveError> {
        let query = format!("'{}' in parents and trashed=false", folder_id);
        let url = format!(
            "{}/files?q={}&orderBy=createdTime%20desc&pageSize={}&fields=files(id,name,mimeType,size,createdTime)",
            DRIVE_API_BASE,
            urlencoding::encode(&query),
            max_results
        );

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, Self::bearer(access_token))
            .send()
            .await
            .map_err(|e| DriveError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response, true).await);
        }

        let list: DriveFileMetaList = response
            .json()
            .await
            .map_err(|e| DriveError::Parse(e.to_string()))?;

        Ok(list.files.into_iter().map(RemoteFile::from).collect())
    }

    async fn delete_file(&self, access_token: &str, file_id: &str) -> Result<(), DriveError> {
        let url = format!("{}/files/{}", DRIVE_API_BASE, urlencoding::encode(file_id));

        let response = self
            .client
            .delete(&url)
            .header(AUTHORIZATION, Self::bearer(access_token))
            .send()
            .await
            .map_err(|e| DriveError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_for(response, false).await);
        }

        info!("Deleted file {}", file_id);
        Ok(())
    }
}

/// `multipart/related` body: JSON metadata part followed by the
/// base64-encoded file part.
fn build_multipart_body(metadata_json: &str, mime_type: &str, content_b64: &str) -> String {
    let mut body = String::with_capacity(content_b64.len() + metadata_json.len() + 256);
    body.push_str(&format!("--{}\r\n", MULTIPART_BOUNDARY));
    body.push_str("Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.push_str(metadata_json);
    body.push_str("\r\n");
    body.push_str(&format!("--{}\r\n", MULTIPART_BOUNDARY));
    body.push_str(&format!("Content-Type: {}\r\n", mime_type));
    body.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
    body.push_str(content_b64);
    body.push_str(&format!("\r\n--{}--", MULTIPART_BOUNDARY));
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipart_body_layout() {
        let body = build_multipart_body("{\"name\":\"a.pdf\"}", "application/pdf", "QUJD");

        assert!(body.starts_with(&format!("--{}\r\n", MULTIPART_BOUNDARY)));
        assert!(body.ends_with(&format!("\r\n--{}--", MULTIPART_BOUNDARY)));
        assert!(body.contains("Content-Type: application/json; charset=UTF-8"));
        assert!(body.contains("Content-Type: application/pdf"));
        assert!(body.contains("Content-Transfer-Encoding: base64"));
        assert!(body.contains("QUJD"));
        // Metadata part comes before the content part
        assert!(body.find("application/json").unwrap() < body.find("application/pdf").unwrap());
    }

    #[test]
    fn test_file_meta_mapping() {
        let meta: DriveFileMeta = serde_json::from_value(serde_json::json!({
            "id": "f1",
            "name": "contract.pdf",
            "mimeType": "application/pdf",
            "size": "2048",
            "createdTime": "2026-08-01T12:00:00.000Z"
        }))
        .unwrap();
        let file = RemoteFile::from(meta);
        assert_eq!(file.size, Some(2048));
        assert!(file.created_at.is_some());

        // Provider-native docs carry no size
        let meta: DriveFileMeta = serde_json::from_value(serde_json::json!({
            "id": "f2",
            "name": "notes",
            "mimeType": "application/vnd.google-apps.document"
        }))
        .unwrap();
        let file = RemoteFile::from(meta);
        assert_eq!(file.size, None);
        assert!(file.created_at.is_none());
    }
}
