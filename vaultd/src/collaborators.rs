//! External collaborator traits (SPEC_FULL.md §6.1) plus minimal reference implementations.
//!
//! The core service never talks to a real database, identity provider or audit log; it only
//! talks to these traits. Each reference implementation below is the fixture a binary wires in
//! for local runs and tests, not a production backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{BackupConfig, DatabaseEngine};
use remote_storage::BoxedReader;

#[derive(Debug, Clone)]
pub struct Database {
    pub id: Uuid,
    pub workspace_id: Option<Uuid>,
    pub engine: DatabaseEngine,
    pub last_backup_error: Option<String>,
    pub last_backup_time: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait DatabaseService: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Option<Database>;
    async fn get_all(&self) -> Vec<Database>;
    async fn set_backup_error(&self, id: Uuid, message: Option<String>);
    async fn set_last_backup_time(&self, id: Uuid, at: DateTime<Utc>);
}

#[async_trait]
pub trait NotifierService: Send + Sync {
    async fn send_notification(&self, title: &str, message: &str);
}

#[async_trait]
pub trait BackupConfigService: Send + Sync {
    async fn get_by_database_id(&self, database_id: uuid::Uuid) -> Option<BackupConfig>;
    async fn get_all(&self) -> Vec<BackupConfig>;
}

/// Supplies the key-derivation master secret. Kept synchronous: the secret lives in memory or a
/// local keyring for every implementation worth having, never behind network I/O.
pub trait SecretKeyService: Send + Sync {
    fn get_secret_key(&self) -> [u8; 32];
}

#[async_trait]
pub trait WorkspaceService: Send + Sync {
    async fn can_user_access_workspace(&self, workspace_id: Uuid, user_id: Uuid) -> bool;
    async fn can_user_manage_databases(&self, workspace_id: Uuid, user_id: Uuid) -> bool;
}

#[async_trait]
pub trait AuditLogService: Send + Sync {
    async fn write(&self, message: &str, user_id: Uuid, workspace_id: Option<Uuid>);
}

#[derive(Debug, Error)]
pub enum DumpError {
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One per database engine: produces the raw, uncompressed dump byte stream. Everything
/// downstream (counting, compression, encryption, storage) is the core pipeline's job, not the
/// collaborator's. `cpu_count_hint` controls dump-producer parallelism only (e.g. `pg_dump
/// --jobs`); it has no effect on anything downstream.
#[async_trait]
pub trait DumpProducer: Send + Sync {
    async fn execute(&self, cancel: &CancellationToken, cpu_count_hint: u32) -> Result<BoxedReader, DumpError>;
}

// --- Reference implementations -------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryDatabaseService {
    databases: RwLock<HashMap<Uuid, Database>>,
}

impl InMemoryDatabaseService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, database: Database) {
        self.databases.write().insert(database.id, database);
    }
}

#[async_trait]
impl DatabaseService for InMemoryDatabaseService {
    async fn get_by_id(&self, id: Uuid) -> Option<Database> {
        self.databases.read().get(&id).cloned()
    }

    async fn get_all(&self) -> Vec<Database> {
        self.databases.read().values().cloned().collect()
    }

    async fn set_backup_error(&self, id: Uuid, message: Option<String>) {
        if let Some(db) = self.databases.write().get_mut(&id) {
            db.last_backup_error = message;
        }
    }

    async fn set_last_backup_time(&self, id: Uuid, at: DateTime<Utc>) {
        if let Some(db) = self.databases.write().get_mut(&id) {
            db.last_backup_time = Some(at);
        }
    }
}

#[derive(Default)]
pub struct InMemoryBackupConfigService {
    configs: RwLock<HashMap<Uuid, BackupConfig>>,
}

impl InMemoryBackupConfigService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, config: BackupConfig) {
        self.configs.write().insert(config.database_id, config);
    }
}

#[async_trait]
impl BackupConfigService for InMemoryBackupConfigService {
    async fn get_by_database_id(&self, database_id: Uuid) -> Option<BackupConfig> {
        self.configs.read().get(&database_id).cloned()
    }

    async fn get_all(&self) -> Vec<BackupConfig> {
        self.configs.read().values().cloned().collect()
    }
}

/// Logs notifications via `tracing` rather than delivering them anywhere; real delivery
/// (email/webhook/Slack) is an external collaborator this service never implements.
pub struct LoggingNotifier;

#[async_trait]
impl NotifierService for LoggingNotifier {
    async fn send_notification(&self, title: &str, message: &str) {
        tracing::info!(title, message, "notification");
    }
}

pub struct StaticSecretKeyService {
    key: [u8; 32],
}

impl StaticSecretKeyService {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }
}

impl SecretKeyService for StaticSecretKeyService {
    fn get_secret_key(&self) -> [u8; 32] {
        self.key
    }
}

/// Grants every request: useful for tests and single-tenant deployments where workspace
/// membership isn't enforced by this service at all.
pub struct AllowAllWorkspaceService;

#[async_trait]
impl WorkspaceService for AllowAllWorkspaceService {
    async fn can_user_access_workspace(&self, _workspace_id: Uuid, _user_id: Uuid) -> bool {
        true
    }

    async fn can_user_manage_databases(&self, _workspace_id: Uuid, _user_id: Uuid) -> bool {
        true
    }
}

#[derive(Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<Vec<String>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.read().clone()
    }
}

#[async_trait]
impl AuditLogService for InMemoryAuditLog {
    async fn write(&self, message: &str, user_id: Uuid, workspace_id: Option<Uuid>) {
        let entry = format!("user={user_id} workspace={workspace_id:?} {message}");
        tracing::info!(%entry, "audit");
        self.entries.write().push(entry);
    }
}

/// Produces a fixed in-memory payload instead of shelling out to a real dump tool. Stands in for
/// the per-engine collaborator (`pg_dump`, `mysqldump`, ...) in tests and local runs.
pub struct FixtureDumpProducer {
    payload: Vec<u8>,
}

impl FixtureDumpProducer {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }
}

#[async_trait]
impl DumpProducer for FixtureDumpProducer {
    async fn execute(&self, _cancel: &CancellationToken, _cpu_count_hint: u32) -> Result<BoxedReader, DumpError> {
        Ok(Box::pin(std::io::Cursor::new(self.payload.clone())))
    }
}
