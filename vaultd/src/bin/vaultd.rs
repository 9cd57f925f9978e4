//! Composition root: wires collaborators together and runs the scheduler until shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use vaultd::cancel::CancellationRegistry;
use vaultd::collaborators::{
    Database, DatabaseService, DumpProducer, FixtureDumpProducer, InMemoryAuditLog,
    InMemoryBackupConfigService, InMemoryDatabaseService, LoggingNotifier, StaticSecretKeyService,
};
use vaultd::config::{BackupConfig, DatabaseEngine, DesiredEncryption, NotificationEvent};
use vaultd::orchestrator::Orchestrator;
use vaultd::record::InMemoryRecordStore;
use vaultd::schedule::Schedule;
use vaultd::scheduler::Scheduler;

/// Scheduled database backup service.
#[derive(Parser, Debug)]
#[command(name = "vaultd", version)]
struct CliArgs {
    /// Directory artifacts are written under.
    #[arg(long, default_value = "./vaultd-data")]
    data_dir: Utf8PathBuf,

    /// How often the scheduler evaluates every database's backup config.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    tick_period: Duration,

    /// 64 hex characters (32 bytes), used to derive per-backup encryption keys. Backups for
    /// databases with encryption enabled fail to start without one.
    #[arg(long, env = "VAULTD_SECRET_KEY")]
    secret_key_hex: Option<String>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_tracing();

    let secret_key = match args.secret_key_hex {
        Some(hex_key) => {
            let bytes = hex::decode(&hex_key)?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("--secret-key-hex must decode to exactly 32 bytes"))?;
            key
        }
        None => {
            tracing::warn!("no secret key configured; encrypted backups will fail to start");
            [0u8; 32]
        }
    };

    let storage = Arc::new(remote_storage::LocalFs::new(args.data_dir).await?);
    let records = InMemoryRecordStore::new();
    let databases = InMemoryDatabaseService::new();
    let configs = InMemoryBackupConfigService::new();

    let orchestrator = Arc::new(Orchestrator {
        records: records.clone(),
        cancellations: Arc::new(CancellationRegistry::new()),
        storage,
        notifier: Arc::new(LoggingNotifier),
        secret_keys: Arc::new(StaticSecretKeyService::new(secret_key)),
        audit_log: InMemoryAuditLog::new(),
    });

    seed_demo_database(&databases, &configs);

    let all_database_ids: Vec<Uuid> = databases.get_all().await.iter().map(|d| d.id).collect();
    orchestrator.reconcile_interrupted(&all_database_ids).await;

    let mut dump_producers: HashMap<DatabaseEngine, Arc<dyn DumpProducer>> = HashMap::new();
    dump_producers.insert(
        DatabaseEngine::Postgres,
        Arc::new(FixtureDumpProducer::new(b"placeholder dump bytes".to_vec())),
    );

    let scheduler = Scheduler::new(orchestrator, configs, databases, dump_producers, args.tick_period);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        shutdown.cancel();
    });

    scheduler.run(cancel).await;
    Ok(())
}

/// Registers one demo database so the scheduler has something to evaluate. A real deployment
/// backs [`vaultd::collaborators::DatabaseService`] and [`vaultd::collaborators::BackupConfigService`]
/// with a durable store instead.
fn seed_demo_database(databases: &InMemoryDatabaseService, configs: &InMemoryBackupConfigService) {
    let database_id = Uuid::new_v4();
    databases.insert(Database {
        id: database_id,
        workspace_id: None,
        engine: DatabaseEngine::Postgres,
        last_backup_error: None,
        last_backup_time: None,
    });
    configs.insert(BackupConfig {
        enabled: true,
        database_id,
        storage_id: Uuid::new_v4(),
        engine: DatabaseEngine::Postgres,
        retention_period: Some(chrono::Duration::days(30)),
        schedule: Schedule::Hourly,
        retry_enabled: true,
        max_failed_tries: 3,
        notification_subscriptions: HashSet::from([NotificationEvent::OnFailure]),
        encryption_kind: DesiredEncryption::None,
        cpu_count_hint: 1,
        created_at: chrono::Utc::now(),
    });
}
