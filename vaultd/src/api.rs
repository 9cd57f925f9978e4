//! Public operations exposed by the core (SPEC_FULL.md §6.2).
//!
//! This is the one place permission checks and audit logging happen; [`crate::orchestrator`]
//! trusts its caller and does neither. A REST layer or CLI sits on top of [`BackupService`], never
//! calling [`crate::orchestrator::Orchestrator`] directly.

use std::sync::Arc;

use uuid::Uuid;

use crate::collaborators::{BackupConfigService, DatabaseService, DumpProducer, WorkspaceService};
use crate::config::DatabaseEngine;
use crate::error::ServiceError;
use crate::orchestrator::Orchestrator;
use crate::reader::{self, ReadError};
use crate::record::{BackupRecord, BackupStatus};
use remote_storage::BoxedReader;

pub struct BackupService {
    pub orchestrator: Arc<Orchestrator>,
    pub databases: Arc<dyn DatabaseService>,
    pub configs: Arc<dyn BackupConfigService>,
    pub workspace: Arc<dyn WorkspaceService>,
}

impl BackupService {
    async fn require_manage(&self, user_id: Uuid, database_id: Uuid, action: &str) -> Result<(), ServiceError> {
        let database = self
            .databases
            .get_by_id(database_id)
            .await
            .ok_or_else(|| ServiceError::Other(anyhow::anyhow!("database {database_id} not found")))?;
        let workspace_id = database
            .workspace_id
            .ok_or_else(|| ServiceError::DatabaseWithoutWorkspace(action.to_string()))?;
        if !self.workspace.can_user_manage_databases(workspace_id, user_id).await {
            return Err(ServiceError::InsufficientPermissions(action.to_string()));
        }
        Ok(())
    }

    async fn require_manage_for_backup(&self, user_id: Uuid, backup_id: Uuid, action: &str) -> Result<BackupRecord, ServiceError> {
        let record = self
            .orchestrator
            .records
            .find_by_id(backup_id)
            .await
            .ok_or_else(|| ServiceError::Other(anyhow::anyhow!("backup {backup_id} not found")))?;
        self.require_manage(user_id, record.database_id, action).await?;
        Ok(record)
    }

    /// Dispatches a backup without waiting for it to finish. The caller only observes whether the
    /// attempt *started*; its terminal status is read back later via [`Self::get_backups`].
    pub async fn make_backup_now(
        &self,
        user_id: Uuid,
        database_id: Uuid,
        dump: Arc<dyn DumpProducer>,
    ) -> Result<(), ServiceError> {
        self.require_manage(user_id, database_id, "start a backup").await?;
        let config = self
            .configs
            .get_by_database_id(database_id)
            .await
            .ok_or_else(|| ServiceError::Other(anyhow::anyhow!("no backup config for database {database_id}")))?;

        self.orchestrator
            .audit_log
            .write("requested on-demand backup", user_id, None)
            .await;

        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            // On-demand backups sit outside the scheduler's retry loop entirely, so there is no
            // next attempt to suppress a notification for.
            if let Err(e) = orchestrator.run_backup(database_id, &config, dump.as_ref(), true).await {
                tracing::warn!(%database_id, error = %e, "on-demand backup did not start");
            }
        });
        Ok(())
    }

    pub async fn cancel_backup(&self, user_id: Uuid, backup_id: Uuid) -> Result<(), ServiceError> {
        let record = self.require_manage_for_backup(user_id, backup_id, "cancel backup").await?;
        if record.status != BackupStatus::InProgress {
            return Err(ServiceError::BackupNotInProgress);
        }
        self.orchestrator.cancel_backup(backup_id);
        self.orchestrator
            .audit_log
            .write(&format!("cancelled backup {backup_id}"), user_id, None)
            .await;
        Ok(())
    }

    pub async fn delete_backup(&self, user_id: Uuid, backup_id: Uuid) -> Result<(), ServiceError> {
        self.require_manage_for_backup(user_id, backup_id, "delete backup").await?;
        self.orchestrator.delete_backup(backup_id, user_id).await
    }

    /// Deletes every backup of `database_id`, synchronously. Used both when a database is removed
    /// and when its bound storage changes underneath it — in both cases stale artifacts in the old
    /// location must not linger.
    async fn delete_all_backups(&self, user_id: Uuid, database_id: Uuid) -> Result<(), ServiceError> {
        let records = self.orchestrator.records.find_by_database_id(database_id).await;
        if records.iter().any(|r| r.status == BackupStatus::InProgress) {
            return Err(ServiceError::BackupInProgress);
        }
        for record in records {
            self.orchestrator.delete_backup(record.id, user_id).await?;
        }
        Ok(())
    }

    pub async fn on_database_removed(&self, user_id: Uuid, database_id: Uuid) -> Result<(), ServiceError> {
        self.delete_all_backups(user_id, database_id).await
    }

    pub async fn on_storage_changed(&self, user_id: Uuid, database_id: Uuid) -> Result<(), ServiceError> {
        self.delete_all_backups(user_id, database_id).await
    }

    /// Backups for `database_id`, newest first, paginated.
    pub async fn get_backups(
        &self,
        user_id: Uuid,
        database_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BackupRecord>, ServiceError> {
        self.require_manage(user_id, database_id, "list backups").await?;
        Ok(self
            .orchestrator
            .records
            .find_by_database_id_with_pagination(database_id, limit, offset)
            .await)
    }

    pub async fn get_backup_file(
        &self,
        user_id: Uuid,
        backup_id: Uuid,
    ) -> Result<(BoxedReader, DatabaseEngine), ServiceError> {
        let record = self.require_manage_for_backup(user_id, backup_id, "read backup file").await?;
        let database = self
            .databases
            .get_by_id(record.database_id)
            .await
            .ok_or_else(|| ServiceError::Other(anyhow::anyhow!("database {} not found", record.database_id)))?;
        let reader = reader::open_for_read(&self.orchestrator.storage, self.orchestrator.secret_keys.as_ref(), &record)
            .await
            .map_err(|e| match e {
                ReadError::Service(e) => e,
                other => ServiceError::Other(other.into()),
            })?;
        Ok((reader, database.engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationRegistry;
    use crate::collaborators::{
        AllowAllWorkspaceService, Database, FixtureDumpProducer, InMemoryAuditLog, InMemoryBackupConfigService,
        InMemoryDatabaseService, LoggingNotifier, StaticSecretKeyService,
    };
    use crate::config::{BackupConfig, DesiredEncryption, NotificationEvent};
    use crate::record::InMemoryRecordStore;
    use crate::schedule::Schedule;
    use chrono::Utc;
    use remote_storage::LocalFs;
    use std::collections::HashSet;
    use std::time::Duration;

    async fn service() -> (BackupService, Uuid, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let base = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let storage = Arc::new(LocalFs::new(base).await.unwrap());
        let orchestrator = Arc::new(Orchestrator {
            records: InMemoryRecordStore::new(),
            cancellations: Arc::new(CancellationRegistry::new()),
            storage,
            notifier: Arc::new(LoggingNotifier),
            secret_keys: Arc::new(StaticSecretKeyService::new([7u8; 32])),
            audit_log: InMemoryAuditLog::new(),
        });
        let databases = InMemoryDatabaseService::new();
        let configs = InMemoryBackupConfigService::new();

        let database_id = Uuid::new_v4();
        let workspace_id = Uuid::new_v4();
        databases.insert(Database {
            id: database_id,
            workspace_id: Some(workspace_id),
            engine: DatabaseEngine::Postgres,
            last_backup_error: None,
            last_backup_time: None,
        });
        configs.insert(BackupConfig {
            enabled: true,
            database_id,
            storage_id: Uuid::new_v4(),
            engine: DatabaseEngine::Postgres,
            retention_period: None,
            schedule: Schedule::Hourly,
            retry_enabled: true,
            max_failed_tries: 3,
            notification_subscriptions: HashSet::from([NotificationEvent::OnSuccess]),
            encryption_kind: DesiredEncryption::None,
            cpu_count_hint: 1,
            created_at: Utc::now() - chrono::Duration::days(1),
        });

        let service = BackupService {
            orchestrator,
            databases,
            configs,
            workspace: Arc::new(AllowAllWorkspaceService),
        };
        (service, database_id, dir)
    }

    #[tokio::test]
    async fn make_backup_now_dispatches_without_blocking() {
        let (service, database_id, _dir) = service().await;
        let dump: Arc<dyn DumpProducer> = Arc::new(FixtureDumpProducer::new(b"data".repeat(50)));
        service.make_backup_now(Uuid::new_v4(), database_id, dump).await.unwrap();

        for _ in 0..50 {
            let backups = service.get_backups(Uuid::new_v4(), database_id, 10, 0).await.unwrap();
            if backups.first().map(|r| r.status) == Some(BackupStatus::Completed) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("backup never completed");
    }

    #[tokio::test]
    async fn cancel_backup_rejects_when_not_in_progress() {
        let (service, database_id, _dir) = service().await;
        let config = service.configs.get_by_database_id(database_id).await.unwrap();
        let dump = FixtureDumpProducer::new(b"data".to_vec());
        let record = service.orchestrator.run_backup(database_id, &config, &dump, true).await.unwrap();

        let err = service.cancel_backup(Uuid::new_v4(), record.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::BackupNotInProgress));
    }

    #[tokio::test]
    async fn on_database_removed_rejects_while_backup_in_progress() {
        let (service, database_id, _dir) = service().await;
        service
            .orchestrator
            .records
            .insert_in_progress(Uuid::new_v4(), database_id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();

        let err = service.on_database_removed(Uuid::new_v4(), database_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::BackupInProgress));
    }

    #[tokio::test]
    async fn on_database_removed_deletes_every_backup() {
        let (service, database_id, _dir) = service().await;
        let config = service.configs.get_by_database_id(database_id).await.unwrap();
        let dump = FixtureDumpProducer::new(b"data".repeat(10));
        let record = service.orchestrator.run_backup(database_id, &config, &dump, true).await.unwrap();

        service.on_database_removed(Uuid::new_v4(), database_id).await.unwrap();
        assert!(service.orchestrator.records.find_by_id(record.id).await.is_none());
    }

    #[tokio::test]
    async fn get_backup_file_returns_engine_and_plaintext() {
        let (service, database_id, _dir) = service().await;
        let config = service.configs.get_by_database_id(database_id).await.unwrap();
        let payload = b"file contents".repeat(20);
        let dump = FixtureDumpProducer::new(payload.clone());
        let record = service.orchestrator.run_backup(database_id, &config, &dump, true).await.unwrap();

        let (mut reader, engine) = service.get_backup_file(Uuid::new_v4(), record.id).await.unwrap();
        assert_eq!(engine, DatabaseEngine::Postgres);
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out).await.unwrap();
        assert_eq!(out, payload);
    }
}
