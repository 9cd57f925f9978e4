//! Pluggable storage backend abstraction.
//!
//! This is the "Storage Service" collaborator from the backup service's external-interfaces
//! contract: the core never speaks to S3, a local disk, or Google Drive directly, it only
//! speaks [`RemoteStorage`]. Only a local-filesystem implementation lives here; real
//! cloud-medium backends are out of scope (see the crate's owning repo's DESIGN.md).

mod error;
mod local_fs;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

pub use error::{DownloadError, StorageError};
pub use local_fs::LocalFs;

/// A boxed, type-erased async byte stream, used for both upload sources and download results so
/// that implementations don't leak their concrete reader types across the trait boundary.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send + Sync>>;

/// Key identifying an artifact within a storage backend. Backup artifacts are keyed by backup id
/// alone (see the owning repo's SPEC_FULL.md §6.3) so this is a thin newtype over a string rather
/// than a full path abstraction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A pluggable backup-artifact storage backend.
///
/// Every method takes a [`CancellationToken`] and is expected to check it between chunks of
/// work, matching the cooperative-cancellation contract the dump pipeline relies on (see
/// SPEC_FULL.md §4.4 / §5). Implementations must be safe for concurrent use: multiple backups
/// may upload to or delete from the same backend at once.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Streams `from` to the backend under `to`. Implementations must not leave a partial
    /// object visible under `to` if the upload fails or is cancelled.
    async fn upload(
        &self,
        from: BoxedReader,
        to: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError>;

    /// Opens `from` for reading. Returns [`DownloadError::NotFound`] if no such artifact exists.
    async fn download(&self, from: &RemotePath) -> Result<BoxedReader, DownloadError>;

    /// Removes the artifact at `path`. Deleting a path that doesn't exist is not an error.
    async fn delete(&self, path: &RemotePath, cancel: &CancellationToken) -> Result<(), StorageError>;

    async fn exists(&self, path: &RemotePath) -> Result<bool, StorageError>;
}

/// Shared handle to a storage backend, as held by the orchestrator and artifact reader.
pub type DynRemoteStorage = Arc<dyn RemoteStorage>;
