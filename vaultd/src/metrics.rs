//! Prometheus metrics, registered once into the global default registry.

use once_cell::sync::Lazy;
use prometheus::{register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec, IntCounterVec, IntGauge};

pub static BACKUPS_STARTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vaultd_backups_started_total",
        "Backups started, by database engine",
        &["engine"]
    )
    .expect("vaultd_backups_started_total")
});

pub static BACKUPS_COMPLETED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vaultd_backups_completed_total",
        "Backups reaching a terminal state, by outcome",
        &["outcome"]
    )
    .expect("vaultd_backups_completed_total")
});

pub static BACKUP_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "vaultd_backup_duration_seconds",
        "Wall-clock duration of a backup attempt",
        &["outcome"]
    )
    .expect("vaultd_backup_duration_seconds")
});

pub static RUNNING_BACKUPS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "vaultd_running_backups",
        "Backups currently in progress"
    )
    .expect("vaultd_running_backups")
});
