//! End-to-end tests for the batch upload pipeline over fake transport and
//! token implementations. No network.

use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use lexsync::{
    AgentConfig, AgentRole, DriveError, DriveTransport, FileDescriptor, FileManager, MemoryStore,
    RemoteFile, TokenProvider, UploadConfig, UploadError, UploadHistory, UploadStatus, Uploader,
};

/// Per-file transport behavior, keyed by file name.
#[derive(Clone)]
enum Behavior {
    /// Fail every attempt with this 5xx status.
    AlwaysServer(u16),
    /// 401 while the presented token matches; succeed afterwards.
    UnauthorizedForToken(String),
    /// 401 on every attempt regardless of token.
    AlwaysUnauthorized,
}

#[derive(Default)]
struct FakeTransport {
    folders: Mutex<HashMap<(String, String), String>>,
    find_calls: AtomicUsize,
    create_calls: AtomicUsize,
    upload_calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    behaviors: Mutex<HashMap<String, Behavior>>,
    find_unauthorized: AtomicBool,
    cancel_on_upload: Mutex<Option<CancellationToken>>,
    remote_files: Mutex<Vec<RemoteFile>>,
    list_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    list_behavior: Mutex<Option<Behavior>>,
    delete_behavior: Mutex<Option<Behavior>>,
}

impl FakeTransport {
    fn set_behavior(&self, file_name: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(file_name.to_string(), behavior);
    }

    fn upload_count(&self) -> usize {
        self.upload_calls.lock().unwrap().len()
    }

    fn upload_count_for(&self, file_name: &str) -> usize {
        self.upload_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.as_str() == file_name)
            .count()
    }

    fn seed_remote_file(&self, id: &str, name: &str) {
        self.remote_files.lock().unwrap().push(RemoteFile {
            id: id.to_string(),
            name: name.to_string(),
            mime_type: "application/pdf".to_string(),
            size: Some(1024),
            created_at: None,
        });
    }

    fn check(behavior: &Option<Behavior>, access_token: &str) -> Result<(), DriveError> {
        match behavior {
            Some(Behavior::AlwaysServer(status)) => Err(DriveError::Server(*status)),
            Some(Behavior::UnauthorizedForToken(token)) if access_token == token => {
                Err(DriveError::Unauthorized)
            }
            Some(Behavior::AlwaysUnauthorized) => Err(DriveError::Unauthorized),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DriveTransport for FakeTransport {
    async fn find_folder(
        &self,
        _access_token: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<String>, DriveError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        if self.find_unauthorized.load(Ordering::SeqCst) {
            return Err(DriveError::Unauthorized);
        }
        let folders = self.folders.lock().unwrap();
        Ok(folders.get(&(parent_id.to_string(), name.to_string())).cloned())
    }

    async fn create_folder(
        &self,
        _access_token: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<String, DriveError> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst);
        let id = format!("folder-{}", n);
        self.folders
            .lock()
            .unwrap()
            .insert((parent_id.to_string(), name.to_string()), id.clone());
        Ok(id)
    }

    async fn upload_file(
        &self,
        access_token: &str,
        _folder_id: &str,
        file_name: &str,
        _mime_type: &str,
        _content_b64: &str,
    ) -> Result<String, DriveError> {
        self.upload_calls.lock().unwrap().push(file_name.to_string());
        if let Some(cancel) = self.cancel_on_upload.lock().unwrap().take() {
            cancel.cancel();
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let behavior = self.behaviors.lock().unwrap().get(file_name).cloned();
        match behavior {
            Some(Behavior::AlwaysServer(status)) => Err(DriveError::Server(status)),
            Some(Behavior::UnauthorizedForToken(token)) if access_token == token => {
                Err(DriveError::Unauthorized)
            }
            Some(Behavior::AlwaysUnauthorized) => Err(DriveError::Unauthorized),
            _ => Ok(format!("file-{}", file_name)),
        }
    }

    async fn list_files(
        &self,
        access_token: &str,
        _folder_id: &str,
        max_results: u32,
    ) -> Result<Vec<RemoteFile>, DriveError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.list_behavior.lock().unwrap(), access_token)?;
        let files = self.remote_files.lock().unwrap().clone();
        Ok(files.into_iter().take(max_results as usize).collect())
    }

    async fn delete_file(&self, access_token: &str, file_id: &str) -> Result<(), DriveError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.delete_behavior.lock().unwrap(), access_token)?;
        let mut files = self.remote_files.lock().unwrap();
        if !files.iter().any(|f| f.id == file_id) {
            return Err(DriveError::Request(404, "not found".to_string()));
        }
        files.retain(|f| f.id != file_id);
        Ok(())
    }
}

struct FakeTokens {
    authenticated: AtomicBool,
    refresh_succeeds: bool,
    refresh_calls: AtomicUsize,
    generation: AtomicUsize,
}

impl FakeTokens {
    fn new() -> Self {
        Self {
            authenticated: AtomicBool::new(true),
            refresh_succeeds: true,
            refresh_calls: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
        }
    }

    fn with_failing_refresh() -> Self {
        Self { refresh_succeeds: false, ..Self::new() }
    }
}

#[async_trait]
impl TokenProvider for FakeTokens {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn access_token(&self) -> Result<SecretString, DriveError> {
        if !self.is_authenticated() {
            return Err(DriveError::NotAuthenticated);
        }
        let generation = self.generation.load(Ordering::SeqCst);
        Ok(SecretString::from(format!("token-{}", generation)))
    }

    async fn refresh(&self) -> bool {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.refresh_succeeds {
            self.generation.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    fn logout(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
    }
}

struct Harness {
    transport: Arc<FakeTransport>,
    tokens: Arc<FakeTokens>,
    history: Arc<UploadHistory>,
    uploader: Uploader,
    agent: AgentConfig,
    _tmp: tempfile::TempDir,
    dir: PathBuf,
}

fn harness_with(tokens: FakeTokens) -> Harness {
    let transport = Arc::new(FakeTransport::default());
    let tokens = Arc::new(tokens);
    let history = Arc::new(UploadHistory::new(Arc::new(MemoryStore::new()), 20));
    let uploader = Uploader::new(
        transport.clone(),
        tokens.clone(),
        history.clone(),
        UploadConfig::default(),
    );
    let agent = AgentConfig {
        webhook_url: "https://workflows.example.com/webhook/general".to_string(),
        drive_root_folder_id: "root-1".to_string(),
        subfolder_name: "unprocessed".to_string(),
    };
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_path_buf();
    Harness { transport, tokens, history, uploader, agent, _tmp: tmp, dir }
}

fn harness() -> Harness {
    harness_with(FakeTokens::new())
}

impl Harness {
    fn file(&self, name: &str, bytes: &[u8]) -> FileDescriptor {
        let path = self.dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        FileDescriptor::from_path(path).unwrap()
    }

    /// Same as `file`, but with a fabricated size so tests need not write
    /// gigabytes to disk.
    fn file_sized(&self, name: &str, size: u64) -> FileDescriptor {
        let mut descriptor = self.file(name, b"x");
        descriptor.size = size;
        descriptor
    }

    async fn run(&self, files: Vec<FileDescriptor>) -> Result<lexsync::UploadSession, UploadError> {
        self.uploader
            .upload_batch(AgentRole::General, &self.agent, files, &CancellationToken::new())
            .await
    }
}

fn error_message(status: &UploadStatus) -> &str {
    match status {
        UploadStatus::Error { message, .. } => message,
        other => panic!("expected error status, got {:?}", other),
    }
}

#[tokio::test]
async fn successful_batch_records_history() {
    let h = harness();
    let files = vec![h.file("a.pdf", b"%PDF-a"), h.file("b.pdf", b"%PDF-b")];

    let session = h.run(files).await.unwrap();
    assert_eq!(session.total_files, 2);
    assert_eq!(session.success_count, 2);
    assert_eq!(session.error_count, 0);
    assert!(session
        .items
        .iter()
        .all(|i| matches!(i.status, UploadStatus::Success { .. })));

    // Same outcome persisted in history
    let stored = h.history.get_session(&session.id).unwrap();
    assert_eq!(stored.success_count, 2);
    assert_eq!(stored.items.len(), 2);
}

#[tokio::test]
async fn oversized_file_rejects_whole_batch_before_network() {
    let h = harness();
    let files = vec![
        h.file("small.pdf", b"%PDF"),
        h.file_sized("huge.pdf", 51 * 1024 * 1024),
    ];

    let err = h.run(files).await.unwrap_err();
    match err {
        UploadError::FilesTooLarge(names) => assert_eq!(names, vec!["huge.pdf"]),
        other => panic!("expected FilesTooLarge, got {:?}", other),
    }

    // Nothing touched the provider and no session was recorded
    assert_eq!(h.transport.find_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.transport.upload_count(), 0);
    assert!(h.history.list_sessions().is_empty());
}

#[tokio::test]
async fn folder_resolution_is_idempotent_across_batches() {
    let h = harness();

    h.run(vec![h.file("one.pdf", b"%PDF")]).await.unwrap();
    h.run(vec![h.file("two.pdf", b"%PDF")]).await.unwrap();

    // Second batch found the folder created by the first
    assert_eq!(h.transport.create_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.find_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn empty_root_container_rejected_without_network() {
    let mut h = harness();
    h.agent.drive_root_folder_id = "  ".to_string();

    let err = h.run(vec![h.file("a.pdf", b"%PDF")]).await.unwrap_err();
    assert!(matches!(
        err,
        UploadError::FolderResolution(DriveError::InvalidRootContainer(_))
    ));
    assert_eq!(h.transport.find_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn server_errors_retry_up_to_bound_then_settle() {
    let h = harness();
    let file = h.file("flaky.pdf", b"%PDF");
    h.transport.set_behavior("flaky.pdf", Behavior::AlwaysServer(503));

    let session = h.run(vec![file]).await.unwrap();
    assert_eq!(session.error_count, 1);

    // Initial attempt plus max_server_retries extras
    assert_eq!(h.transport.upload_count_for("flaky.pdf"), 3);
    match &session.items[0].status {
        UploadStatus::Error { message, retries } => {
            assert_eq!(*retries, 2);
            assert!(message.contains("503"), "unexpected message: {}", message);
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn unauthorized_refreshes_once_and_retries() {
    let h = harness();
    let file = h.file("doc.pdf", b"%PDF");
    // First token is rejected, the refreshed one is accepted
    h.transport
        .set_behavior("doc.pdf", Behavior::UnauthorizedForToken("token-0".to_string()));

    let session = h.run(vec![file]).await.unwrap();
    assert_eq!(session.success_count, 1);
    assert_eq!(h.tokens.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.upload_count_for("doc.pdf"), 2);
    assert!(h.tokens.is_authenticated());
}

#[tokio::test]
async fn persistent_unauthorized_clears_credential() {
    let h = harness();
    let file = h.file("doc.pdf", b"%PDF");
    h.transport.set_behavior("doc.pdf", Behavior::AlwaysUnauthorized);

    let session = h.run(vec![file]).await.unwrap();
    assert_eq!(session.error_count, 1);
    assert_eq!(error_message(&session.items[0].status), "session expired");
    // One refresh was attempted, the second 401 gave up
    assert_eq!(h.tokens.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.upload_count_for("doc.pdf"), 2);
    assert!(!h.tokens.is_authenticated());
}

#[tokio::test]
async fn failed_refresh_during_resolution_expires_session() {
    let h = harness_with(FakeTokens::with_failing_refresh());
    h.transport.find_unauthorized.store(true, Ordering::SeqCst);

    let err = h.run(vec![h.file("a.pdf", b"%PDF")]).await.unwrap_err();
    assert!(matches!(
        err,
        UploadError::FolderResolution(DriveError::SessionExpired)
    ));
    assert!(!h.tokens.is_authenticated());
}

#[tokio::test]
async fn disallowed_type_fails_alone_without_stopping_siblings() {
    let h = harness();
    let files = vec![h.file("brief.pdf", b"%PDF"), h.file("tool.exe", b"MZ")];

    let session = h.run(files).await.unwrap();
    assert_eq!(session.success_count, 1);
    assert_eq!(session.error_count, 1);

    let exe = session.items.iter().find(|i| i.file_name == "tool.exe").unwrap();
    assert_eq!(error_message(&exe.status), "file type not allowed");
    // The rejected file never reached the provider
    assert_eq!(h.transport.upload_count_for("tool.exe"), 0);
    assert_eq!(h.transport.upload_count_for("brief.pdf"), 1);
}

#[tokio::test]
async fn concurrency_stays_within_group_bound() {
    let h = harness();
    let files: Vec<_> = (0..7)
        .map(|n| h.file(&format!("doc{}.pdf", n), b"%PDF"))
        .collect();

    let session = h.run(files).await.unwrap();
    assert_eq!(session.success_count, 7);
    assert_eq!(h.transport.upload_count(), 7);
    assert!(h.transport.max_in_flight.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn not_authenticated_is_a_precondition() {
    let h = harness();
    h.tokens.logout();

    let err = h.run(vec![h.file("a.pdf", b"%PDF")]).await.unwrap_err();
    assert!(matches!(err, UploadError::NotAuthenticated));
    assert_eq!(h.transport.find_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_settles_in_flight_and_marks_the_rest() {
    let h = harness();
    let cancel = CancellationToken::new();
    // First upload call trips the token, so the first group settles and the
    // second group never starts
    *h.transport.cancel_on_upload.lock().unwrap() = Some(cancel.clone());

    let files: Vec<_> = (0..5)
        .map(|n| h.file(&format!("doc{}.pdf", n), b"%PDF"))
        .collect();
    let session = h
        .uploader
        .upload_batch(AgentRole::General, &h.agent, files, &cancel)
        .await
        .unwrap();

    assert_eq!(session.success_count, 3);
    assert_eq!(session.error_count, 2);
    assert_eq!(h.transport.upload_count(), 3);
    let cancelled: Vec<_> = session
        .items
        .iter()
        .filter(|i| matches!(&i.status, UploadStatus::Error { message, .. } if message == "cancelled"))
        .collect();
    assert_eq!(cancelled.len(), 2);
    // Count invariant holds under cancellation too
    assert_eq!(session.success_count + session.error_count, session.total_files);
}

#[tokio::test(start_paused = true)]
async fn oversized_retry_budget_backs_off_without_panicking() {
    let h = harness();
    let file = h.file("stubborn.pdf", b"%PDF");
    h.transport.set_behavior("stubborn.pdf", Behavior::AlwaysServer(500));

    let uploader = Uploader::new(
        h.transport.clone(),
        h.tokens.clone(),
        h.history.clone(),
        UploadConfig { max_server_retries: 64, ..UploadConfig::default() },
    );
    let session = uploader
        .upload_batch(AgentRole::General, &h.agent, vec![file], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(session.error_count, 1);
    assert_eq!(h.transport.upload_count_for("stubborn.pdf"), 65);
}

#[tokio::test]
async fn listing_recovers_from_one_expired_token() {
    let h = harness();
    h.transport.seed_remote_file("f1", "contract.pdf");
    h.transport.seed_remote_file("f2", "petition.pdf");
    *h.transport.list_behavior.lock().unwrap() =
        Some(Behavior::UnauthorizedForToken("token-0".to_string()));

    let files = FileManager::new(h.transport.clone(), h.tokens.clone());
    let listed = files.list("folder-0", 10).await.unwrap();

    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, "f1");
    assert_eq!(h.tokens.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.list_calls.load(Ordering::SeqCst), 2);
    assert!(h.tokens.is_authenticated());
}

#[tokio::test]
async fn listing_respects_the_result_bound() {
    let h = harness();
    for n in 0..5 {
        h.transport.seed_remote_file(&format!("f{}", n), &format!("doc{}.pdf", n));
    }

    let files = FileManager::new(h.transport.clone(), h.tokens.clone());
    let listed = files.list("folder-0", 3).await.unwrap();
    assert_eq!(listed.len(), 3);
}

#[tokio::test]
async fn delete_removes_the_remote_file() {
    let h = harness();
    h.transport.seed_remote_file("f1", "contract.pdf");

    let files = FileManager::new(h.transport.clone(), h.tokens.clone());
    files.delete("f1").await.unwrap();
    assert!(h.transport.remote_files.lock().unwrap().is_empty());

    // Deleting again surfaces the provider's rejection
    let err = files.delete("f1").await.unwrap_err();
    assert!(matches!(err, DriveError::Request(404, _)));
}

#[tokio::test]
async fn delete_clears_credential_on_persistent_auth_failure() {
    let h = harness();
    h.transport.seed_remote_file("f1", "contract.pdf");
    *h.transport.delete_behavior.lock().unwrap() = Some(Behavior::AlwaysUnauthorized);

    let files = FileManager::new(h.transport.clone(), h.tokens.clone());
    let err = files.delete("f1").await.unwrap_err();

    assert!(matches!(err, DriveError::SessionExpired));
    // One refresh was attempted, the second 401 gave up
    assert_eq!(h.tokens.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.delete_calls.load(Ordering::SeqCst), 2);
    assert!(!h.tokens.is_authenticated());
}
