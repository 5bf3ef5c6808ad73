//! Google Drive upload core: token lifecycle, folder resolution, and the
//! batch upload orchestrator.

pub mod files;
pub mod folders;
pub mod token;
pub mod transport;
pub mod types;
pub mod upload;

pub use files::FileManager;
pub use folders::FolderResolver;
pub use token::{bind_callback_listener, wait_for_callback, StoredTokens, TokenManager, TokenProvider};
pub use transport::{DriveTransport, HttpDriveTransport};
pub use types::{classify_message, DriveError, FileDescriptor, RemoteFile};
pub use upload::{UploadError, Uploader};
