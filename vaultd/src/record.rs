//! Backup record store (component C2).
//!
//! A backup record is the durable result of one backup attempt. The store is the single source
//! of truth the orchestrator, retention evaluator and scheduler all read from; everything here is
//! plain data plus a storage trait, no business logic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// Mirrors the two-column (kind, salt/iv) shape of the persisted schema (SPEC_FULL.md §6.3)
/// rather than collapsing it into an `Option<EncryptionMetadata>`, so the integrity check in
/// [`crate::reader`] has a real inconsistent state to guard against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EncryptionKind {
    None,
    Encrypted,
}

#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub id: Uuid,
    pub database_id: Uuid,
    pub storage_id: Uuid,
    pub status: BackupStatus,
    pub size_mb: f64,
    pub duration_ms: i64,
    pub fail_message: Option<String>,
    pub encryption: EncryptionKind,
    pub encryption_salt: Option<[u8; 16]>,
    pub encryption_iv: Option<[u8; 12]>,
    pub created_at: DateTime<Utc>,
}

/// Parsed (salt, iv) pair of an `ENCRYPTED` record.
pub type EncryptionSaltIv = ([u8; 16], [u8; 12]);

impl BackupRecord {
    pub fn new_in_progress(
        id: Uuid,
        database_id: Uuid,
        storage_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            database_id,
            storage_id,
            status: BackupStatus::InProgress,
            size_mb: 0.0,
            duration_ms: 0,
            fail_message: None,
            encryption: EncryptionKind::None,
            encryption_salt: None,
            encryption_iv: None,
            created_at,
        }
    }

    /// Validates the (kind, salt, iv) invariant a freshly loaded row must uphold: NONE carries no
    /// key material, ENCRYPTED always carries both. Returns the parsed salt/iv pair on success.
    pub fn encryption_metadata(&self) -> Result<Option<EncryptionSaltIv>, ServiceError> {
        match self.encryption {
            EncryptionKind::None => Ok(None),
            EncryptionKind::Encrypted => match (self.encryption_salt, self.encryption_iv) {
                (Some(salt), Some(iv)) => Ok(Some((salt, iv))),
                _ => Err(ServiceError::MissingEncryptionMetadata),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("backup is in progress")]
    AlreadyInProgress,
    #[error("record {0} not found")]
    NotFound(Uuid),
}

/// Durable store for backup records, keyed by backup id.
///
/// `insert_in_progress` is the one write the orchestrator relies on for mutual exclusion: it must
/// fail if a record for `database_id` is already `IN_PROGRESS`, which is what makes "at most one
/// backup running per database" an invariant of the store rather than of its callers.
#[async_trait]
pub trait BackupRecordStore: Send + Sync {
    async fn insert_in_progress(
        &self,
        id: Uuid,
        database_id: Uuid,
        storage_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<BackupRecord, RecordError>;

    async fn save(&self, record: BackupRecord) -> Result<(), RecordError>;

    async fn find_by_id(&self, id: Uuid) -> Option<BackupRecord>;

    /// All records for a database, newest first.
    async fn find_by_database_id(&self, database_id: Uuid) -> Vec<BackupRecord>;

    /// A page of a database's records, newest first, without loading the rest.
    async fn find_by_database_id_with_pagination(
        &self,
        database_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Vec<BackupRecord>;

    async fn count_by_database_id(&self, database_id: Uuid) -> usize;

    async fn find_by_database_id_and_status(&self, database_id: Uuid, status: BackupStatus) -> Vec<BackupRecord>;

    async fn find_last_by_database_id(&self, database_id: Uuid) -> Option<BackupRecord>;

    async fn find_last_completed(&self, database_id: Uuid) -> Option<BackupRecord>;

    async fn delete_by_id(&self, id: Uuid) -> Result<(), RecordError>;
}

#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<Uuid, BackupRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl BackupRecordStore for InMemoryRecordStore {
    async fn insert_in_progress(
        &self,
        id: Uuid,
        database_id: Uuid,
        storage_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<BackupRecord, RecordError> {
        let mut records = self.records.write().await;
        let already_running = records
            .values()
            .any(|r| r.database_id == database_id && r.status == BackupStatus::InProgress);
        if already_running {
            return Err(RecordError::AlreadyInProgress);
        }
        let record = BackupRecord::new_in_progress(id, database_id, storage_id, created_at);
        records.insert(id, record.clone());
        Ok(record)
    }

    async fn save(&self, record: BackupRecord) -> Result<(), RecordError> {
        self.records.write().await.insert(record.id, record);
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Option<BackupRecord> {
        self.records.read().await.get(&id).cloned()
    }

    async fn find_by_database_id(&self, database_id: Uuid) -> Vec<BackupRecord> {
        let mut out: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.database_id == database_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        out
    }

    async fn find_by_database_id_with_pagination(
        &self,
        database_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Vec<BackupRecord> {
        self.find_by_database_id(database_id)
            .await
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect()
    }

    async fn count_by_database_id(&self, database_id: Uuid) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.database_id == database_id)
            .count()
    }

    async fn find_by_database_id_and_status(&self, database_id: Uuid, status: BackupStatus) -> Vec<BackupRecord> {
        self.find_by_database_id(database_id)
            .await
            .into_iter()
            .filter(|r| r.status == status)
            .collect()
    }

    async fn find_last_by_database_id(&self, database_id: Uuid) -> Option<BackupRecord> {
        self.find_by_database_id(database_id).await.into_iter().next()
    }

    async fn find_last_completed(&self, database_id: Uuid) -> Option<BackupRecord> {
        self.find_by_database_id(database_id)
            .await
            .into_iter()
            .find(|r| r.status == BackupStatus::Completed)
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<(), RecordError> {
        match self.records.write().await.remove(&id) {
            Some(_) => Ok(()),
            None => Err(RecordError::NotFound(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_insert_while_in_progress_is_rejected() {
        let store = InMemoryRecordStore::new();
        let db = Uuid::new_v4();
        store
            .insert_in_progress(Uuid::new_v4(), db, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        let err = store
            .insert_in_progress(Uuid::new_v4(), db, Uuid::new_v4(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, RecordError::AlreadyInProgress));
    }

    #[tokio::test]
    async fn find_by_database_id_is_newest_first() {
        let store = InMemoryRecordStore::new();
        let db = Uuid::new_v4();
        let older = BackupRecord::new_in_progress(Uuid::new_v4(), db, Uuid::new_v4(), Utc::now());
        let mut newer =
            BackupRecord::new_in_progress(Uuid::new_v4(), db, Uuid::new_v4(), Utc::now());
        newer.created_at = older.created_at + chrono::Duration::seconds(1);
        store.save(older.clone()).await.unwrap();
        store.save(newer.clone()).await.unwrap();

        let found = store.find_by_database_id(db).await;
        assert_eq!(found[0].id, newer.id);
        assert_eq!(found[1].id, older.id);
    }

    #[tokio::test]
    async fn pagination_and_count_and_status_filter() {
        let store = InMemoryRecordStore::new();
        let db = Uuid::new_v4();
        let base = Utc::now();
        for i in 0..5 {
            let mut record =
                BackupRecord::new_in_progress(Uuid::new_v4(), db, Uuid::new_v4(), base + chrono::Duration::seconds(i));
            record.status = if i % 2 == 0 { BackupStatus::Completed } else { BackupStatus::Failed };
            store.save(record).await.unwrap();
        }

        assert_eq!(store.count_by_database_id(db).await, 5);

        let page = store.find_by_database_id_with_pagination(db, 2, 1).await;
        assert_eq!(page.len(), 2);
        let full = store.find_by_database_id(db).await;
        assert_eq!(page[0].id, full[1].id);
        assert_eq!(page[1].id, full[2].id);

        let completed = store.find_by_database_id_and_status(db, BackupStatus::Completed).await;
        assert_eq!(completed.len(), 3);
        assert!(completed.iter().all(|r| r.status == BackupStatus::Completed));

        let last = store.find_last_by_database_id(db).await.unwrap();
        assert_eq!(last.id, full[0].id);
    }

    #[test]
    fn encrypted_without_metadata_is_rejected() {
        let mut record = BackupRecord::new_in_progress(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Utc::now(),
        );
        record.encryption = EncryptionKind::Encrypted;
        let err = record.encryption_metadata().unwrap_err();
        assert!(matches!(err, ServiceError::MissingEncryptionMetadata));
    }
}
