//! Backup lifecycle orchestrator (component C5).
//!
//! Owns the state transitions a backup goes through: claim the `IN_PROGRESS` slot, run the
//! pipeline, classify the outcome, persist the terminal record, notify, and — on cancellation or
//! failure — clean up whatever the pipeline may have written. Nothing here talks to a specific
//! database engine or storage backend directly; both arrive as collaborators.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::cancel::CancellationRegistry;
use crate::collaborators::{AuditLogService, DumpProducer, NotifierService, SecretKeyService};
use crate::config::{BackupConfig, DesiredEncryption, NotificationEvent};
use crate::crypto::EncryptionMetadata;
use crate::error::ServiceError;
use crate::metrics;
use crate::pipeline::{self, PipelineError, PipelineInput};
use crate::record::{BackupRecord, BackupRecordStore, BackupStatus, EncryptionKind};
use remote_storage::{DynRemoteStorage, RemotePath};

pub struct Orchestrator {
    pub records: Arc<dyn BackupRecordStore>,
    pub cancellations: Arc<CancellationRegistry>,
    pub storage: DynRemoteStorage,
    pub notifier: Arc<dyn NotifierService>,
    pub secret_keys: Arc<dyn SecretKeyService>,
    pub audit_log: Arc<dyn AuditLogService>,
}

impl Orchestrator {
    /// Runs one backup attempt for `database_id` to completion. Returns the terminal record.
    /// Fails fast with [`ServiceError::BackupInProgress`] if one is already running for this
    /// database; that check and the `IN_PROGRESS` insert happen atomically in the record store.
    ///
    /// `is_last_attempt` gates failure notifications: a retry that still has budget left must not
    /// spam a subscriber, so only the last allowed attempt (or any attempt when retries are
    /// disabled) notifies on failure.
    pub async fn run_backup(
        &self,
        database_id: Uuid,
        config: &BackupConfig,
        dump: &dyn DumpProducer,
        is_last_attempt: bool,
    ) -> Result<BackupRecord, ServiceError> {
        let backup_id = Uuid::new_v4();
        let started_at = Utc::now();

        let record = self
            .records
            .insert_in_progress(backup_id, database_id, config.storage_id, started_at)
            .await
            .map_err(|_| ServiceError::BackupInProgress)?;

        metrics::RUNNING_BACKUPS.inc();
        metrics::BACKUPS_STARTED
            .with_label_values(&[&config.engine.to_string()])
            .inc();

        let span = tracing::info_span!("run_backup", %backup_id, %database_id);
        let result = self
            .drive_pipeline(record, database_id, config, dump, started_at, is_last_attempt)
            .instrument(span)
            .await;

        metrics::RUNNING_BACKUPS.dec();
        self.cancellations.unregister(backup_id);

        Ok(result)
    }

    async fn drive_pipeline(
        &self,
        in_progress: BackupRecord,
        database_id: Uuid,
        config: &BackupConfig,
        dump: &dyn DumpProducer,
        started_at: chrono::DateTime<Utc>,
        is_last_attempt: bool,
    ) -> BackupRecord {
        let backup_id = in_progress.id;
        let cancel = self.cancellations.register(backup_id);
        let secret_key = match config.encryption_kind {
            DesiredEncryption::None => None,
            DesiredEncryption::Encrypted => Some(self.secret_keys.get_secret_key()),
        };

        let storage_key = RemotePath::new(backup_id.to_string());
        let input = PipelineInput {
            backup_id,
            desired_encryption: config.encryption_kind,
            secret_key,
            storage: self.storage.clone(),
            storage_key: storage_key.clone(),
            cancel: cancel.clone(),
            cpu_count_hint: config.cpu_count_hint,
        };

        let clock_start = Instant::now();
        let outcome = pipeline::run(dump, input, |bytes| {
            tracing::debug!(backup_id = %backup_id, bytes, "backup progress");
        })
        .await;
        let duration_ms = clock_start.elapsed().as_millis() as i64;

        let record = match outcome {
            Ok(success) => {
                info!(%backup_id, size_mb = success.size_mb, "backup completed");
                metrics::BACKUPS_COMPLETED.with_label_values(&["completed"]).inc();
                metrics::BACKUP_DURATION_SECONDS
                    .with_label_values(&["completed"])
                    .observe(duration_ms as f64 / 1000.0);
                self.notify(config, NotificationEvent::OnSuccess, database_id, "Backup completed")
                    .await;
                completed_record(backup_id, database_id, config, started_at, duration_ms, success)
            }
            Err(PipelineError::Cancelled) if self.cancellations.is_shutting_down() => {
                // Process shutdown cancelled every scope indiscriminately; this one just happened
                // to be caught mid-run. Leave it IN_PROGRESS: the next start's reconciliation pass
                // marks it FAILED("interrupted by restart"), not this one.
                warn!(%backup_id, "backup interrupted by shutdown, leaving in progress for reconciliation");
                return in_progress;
            }
            Err(PipelineError::Cancelled) => {
                warn!(%backup_id, "backup cancelled");
                metrics::BACKUPS_COMPLETED.with_label_values(&["cancelled"]).inc();
                self.cleanup_partial_artifact(&storage_key).await;
                cancelled_record(backup_id, database_id, config, started_at, duration_ms)
            }
            Err(e) => {
                warn!(%backup_id, error = %e, "backup failed");
                metrics::BACKUPS_COMPLETED.with_label_values(&["failed"]).inc();
                metrics::BACKUP_DURATION_SECONDS
                    .with_label_values(&["failed"])
                    .observe(duration_ms as f64 / 1000.0);
                self.cleanup_partial_artifact(&storage_key).await;
                if is_last_attempt || !config.retry_enabled {
                    self.notify(config, NotificationEvent::OnFailure, database_id, &e.to_string())
                        .await;
                }
                failed_record(backup_id, database_id, config, started_at, duration_ms, e.to_string())
            }
        };

        if let Err(e) = self.records.save(record.clone()).await {
            warn!(%backup_id, error = %e, "failed to persist terminal backup record");
        }
        record
    }

    async fn cleanup_partial_artifact(&self, key: &RemotePath) {
        // Deliberately a fresh token: the cancellation that just aborted the backup must not
        // also abort this cleanup delete.
        let cleanup_cancel = tokio_util::sync::CancellationToken::new();
        if let Err(e) = self.storage.delete(key, &cleanup_cancel).await {
            warn!(error = %e, "failed to remove partial backup artifact");
        }
    }

    async fn notify(&self, config: &BackupConfig, event: NotificationEvent, database_id: Uuid, message: &str) {
        if config.notification_subscriptions.contains(&event) {
            self.notifier
                .send_notification(&format!("Backup {database_id}"), message)
                .await;
        }
    }

    /// Cancels a running backup. Returns immediately; the running attempt observes cancellation
    /// cooperatively at its next pipeline checkpoint. A no-op if no backup is running for this id.
    pub fn cancel_backup(&self, backup_id: Uuid) {
        self.cancellations.cancel(backup_id);
    }

    /// Deletes a terminal backup's record and artifact. Cascading delete is synchronous: the
    /// caller only sees success once both are gone, never eventually-consistent.
    pub async fn delete_backup(&self, backup_id: Uuid, audit_user: Uuid) -> Result<(), ServiceError> {
        let record = self
            .records
            .find_by_id(backup_id)
            .await
            .ok_or(ServiceError::Other(anyhow::anyhow!("backup {backup_id} not found")))?;
        if record.status == BackupStatus::InProgress {
            return Err(ServiceError::BackupInProgress);
        }

        let key = RemotePath::new(backup_id.to_string());
        let cancel = tokio_util::sync::CancellationToken::new();
        self.storage.delete(&key, &cancel).await?;
        self.records
            .delete_by_id(backup_id)
            .await
            .map_err(|e| ServiceError::Other(e.into()))?;
        self.audit_log
            .write(&format!("deleted backup {backup_id}"), audit_user, None)
            .await;
        Ok(())
    }

    /// Startup reconciliation: any record still `IN_PROGRESS` belonged to a process that did not
    /// shut down cleanly and is marked `FAILED` rather than left dangling.
    pub async fn reconcile_interrupted(&self, database_ids: &[Uuid]) {
        for &database_id in database_ids {
            for record in self.records.find_by_database_id(database_id).await {
                if record.status != BackupStatus::InProgress {
                    continue;
                }
                let mut record = record;
                record.status = BackupStatus::Failed;
                record.fail_message = Some("interrupted by restart".to_string());
                if let Err(e) = self.records.save(record).await {
                    warn!(%database_id, error = %e, "failed to reconcile interrupted backup");
                }
            }
        }
    }
}

fn completed_record(
    backup_id: Uuid,
    database_id: Uuid,
    config: &BackupConfig,
    started_at: chrono::DateTime<Utc>,
    duration_ms: i64,
    outcome: pipeline::PipelineOutcome,
) -> BackupRecord {
    let (encryption, salt, iv) = split_encryption(outcome.encryption);
    BackupRecord {
        id: backup_id,
        database_id,
        storage_id: config.storage_id,
        status: BackupStatus::Completed,
        size_mb: outcome.size_mb,
        duration_ms,
        fail_message: None,
        encryption,
        encryption_salt: salt,
        encryption_iv: iv,
        created_at: started_at,
    }
}

fn cancelled_record(
    backup_id: Uuid,
    database_id: Uuid,
    config: &BackupConfig,
    started_at: chrono::DateTime<Utc>,
    duration_ms: i64,
) -> BackupRecord {
    BackupRecord {
        id: backup_id,
        database_id,
        storage_id: config.storage_id,
        status: BackupStatus::Cancelled,
        size_mb: 0.0,
        duration_ms,
        fail_message: None,
        encryption: EncryptionKind::None,
        encryption_salt: None,
        encryption_iv: None,
        created_at: started_at,
    }
}

fn failed_record(
    backup_id: Uuid,
    database_id: Uuid,
    config: &BackupConfig,
    started_at: chrono::DateTime<Utc>,
    duration_ms: i64,
    message: String,
) -> BackupRecord {
    BackupRecord {
        id: backup_id,
        database_id,
        storage_id: config.storage_id,
        status: BackupStatus::Failed,
        size_mb: 0.0,
        duration_ms,
        fail_message: Some(message),
        encryption: EncryptionKind::None,
        encryption_salt: None,
        encryption_iv: None,
        created_at: started_at,
    }
}

fn split_encryption(metadata: Option<EncryptionMetadata>) -> (EncryptionKind, Option<[u8; 16]>, Option<[u8; 12]>) {
    match metadata {
        None => (EncryptionKind::None, None, None),
        Some(m) => (EncryptionKind::Encrypted, Some(m.salt), Some(m.iv)),
    }
}
