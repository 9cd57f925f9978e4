use thiserror::Error;

/// Failure modes for [`crate::RemoteStorage::download`].
///
/// Kept distinct from [`StorageError`] because callers (the artifact reader, in particular)
/// need to tell "no such artifact" apart from "the medium is unavailable".
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no artifact at the given path")]
    NotFound,
    #[error("download cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure modes for writes and deletes against a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
