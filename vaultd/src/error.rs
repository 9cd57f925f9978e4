//! Stable, user-facing error taxonomy (SPEC_FULL.md §6.4 / §7).
//!
//! These strings are part of the external contract: callers (a REST layer, a CLI, tests) match
//! on them, so wording must not drift once published.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("backup is in progress")]
    BackupInProgress,

    #[error("backup is not in progress")]
    BackupNotInProgress,

    #[error("insufficient permissions to {0}")]
    InsufficientPermissions(String),

    #[error("cannot {0} for database without workspace")]
    DatabaseWithoutWorkspace(String),

    #[error("backup marked as encrypted but missing encryption metadata")]
    MissingEncryptionMetadata,

    #[error(transparent)]
    Storage(#[from] remote_storage::StorageError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
