//! Per-database backup configuration.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::schedule::Schedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DatabaseEngine {
    Postgres,
    MySql,
    MariaDb,
    MongoDb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum NotificationEvent {
    OnSuccess,
    OnFailure,
}

/// Encryption a database's *new* backups should use; distinct from [`crate::record::EncryptionKind`],
/// which records what a specific, already-written backup actually used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredEncryption {
    None,
    Encrypted,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub enabled: bool,
    pub database_id: Uuid,
    pub storage_id: Uuid,
    pub engine: DatabaseEngine,
    /// `None` means artifacts are kept forever.
    pub retention_period: Option<Duration>,
    pub schedule: Schedule,
    pub retry_enabled: bool,
    pub max_failed_tries: u32,
    pub notification_subscriptions: HashSet<NotificationEvent>,
    pub encryption_kind: DesiredEncryption,
    /// Parallelism hint passed through to the dump producer, e.g. `pg_dump --jobs`. Never
    /// interpreted by the core itself; always >= 1.
    pub cpu_count_hint: u32,
    pub created_at: DateTime<Utc>,
}
