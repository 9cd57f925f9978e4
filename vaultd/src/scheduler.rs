//! Background scheduler loop (component C6).
//!
//! Mirrors the periodic-background-task shape used throughout the service's composition root:
//! a fixed tick interval, a shared [`CancellationToken`] for clean shutdown, and one pass per
//! tick over every known database's backup config.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::collaborators::{BackupConfigService, DatabaseService, DumpProducer};
use crate::config::DatabaseEngine;
use crate::orchestrator::Orchestrator;
use crate::retention::{self, Decision};

/// How long shutdown waits for in-flight backup tasks to drain after their scopes are cancelled,
/// before giving up and leaving whatever's left for the next start's reconciliation pass.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Scheduler {
    pub orchestrator: Arc<Orchestrator>,
    pub configs: Arc<dyn BackupConfigService>,
    pub databases: Arc<dyn DatabaseService>,
    pub dump_producers: HashMap<DatabaseEngine, Arc<dyn DumpProducer>>,
    pub tick_period: Duration,
    tasks: Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        configs: Arc<dyn BackupConfigService>,
        databases: Arc<dyn DatabaseService>,
        dump_producers: HashMap<DatabaseEngine, Arc<dyn DumpProducer>>,
        tick_period: Duration,
    ) -> Self {
        Self {
            orchestrator,
            configs,
            databases,
            dump_producers,
            tick_period,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Runs until `cancel` is triggered, evaluating every database's schedule/retention state
    /// once per tick and kicking off due backups. On shutdown, cancels every in-flight backup
    /// scope and waits (bounded) for those tasks to drain before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler shutting down");
                    self.orchestrator.cancellations.begin_shutdown();
                    self.drain_tasks().await;
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn drain_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("timed out waiting for in-flight backups to drain; leaving the rest for startup reconciliation");
        }
    }

    /// One pass over every database's config. Due backups are spawned as their own tasks, never
    /// awaited here: a slow backup for one database must not delay evaluating the next.
    async fn tick(&self) {
        let now = Utc::now();
        for config in self.configs.get_all().await {
            if !config.enabled {
                continue;
            }

            let records = self
                .orchestrator
                .records
                .find_by_database_id(config.database_id)
                .await;

            let expired = retention::expired_completed(&records, config.retention_period, now);
            for backup_id in expired {
                if let Err(e) = self
                    .orchestrator
                    .delete_backup(backup_id, config.database_id)
                    .await
                {
                    warn!(%backup_id, error = %e, "failed to prune expired backup");
                }
            }

            if retention::evaluate(&config, now, &records) != Decision::Run {
                continue;
            }

            let Some(dump_producer) = self.dump_producers.get(&config.engine).cloned() else {
                warn!(engine = %config.engine, "no dump producer registered for engine");
                continue;
            };

            let is_last_attempt = retention::is_last_attempt(&config, &records);
            let orchestrator = self.orchestrator.clone();
            let databases = self.databases.clone();
            let database_id = config.database_id;
            self.tasks.lock().await.spawn(async move {
                run_due_backup(
                    orchestrator,
                    databases,
                    database_id,
                    config,
                    dump_producer.as_ref(),
                    is_last_attempt,
                )
                .await;
            });
        }
    }
}

async fn run_due_backup(
    orchestrator: Arc<Orchestrator>,
    databases: Arc<dyn DatabaseService>,
    database_id: Uuid,
    config: crate::config::BackupConfig,
    dump: &dyn DumpProducer,
    is_last_attempt: bool,
) {
    match orchestrator.run_backup(database_id, &config, dump, is_last_attempt).await {
        Ok(record) => {
            databases.set_last_backup_time(database_id, record.created_at).await;
            databases.set_backup_error(database_id, record.fail_message.clone()).await;
        }
        Err(e) => {
            // Another tick (or a manual trigger) is already running this database's backup;
            // nothing to do until it finishes.
            tracing::debug!(%database_id, error = %e, "skipped scheduling tick");
        }
    }
}
