//! Retry/retention evaluation (component C3).
//!
//! Pure functions over a config and its records: no I/O, no clock reads beyond the `now` passed
//! in, so the whole module is deterministic and cheap to exhaust in tests.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::BackupConfig;
use crate::record::{BackupRecord, BackupStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Run,
    Skip,
}

/// `records` must be sorted newest-first (as returned by `BackupRecordStore::find_by_database_id`).
pub fn evaluate(config: &BackupConfig, now: DateTime<Utc>, records: &[BackupRecord]) -> Decision {
    if !config.enabled {
        return Decision::Skip;
    }
    if records.iter().any(|r| r.status == BackupStatus::InProgress) {
        return Decision::Skip;
    }

    if let Some(last) = records.first() {
        if last.status == BackupStatus::Failed && config.retry_enabled {
            let consecutive_failures = records
                .iter()
                .take_while(|r| r.status == BackupStatus::Failed)
                .count();
            if consecutive_failures < config.max_failed_tries as usize {
                return Decision::Run;
            }
        }
    }

    let last_success = records
        .iter()
        .find(|r| r.status == BackupStatus::Completed)
        .map(|r| r.created_at);

    if config
        .schedule
        .is_due(now, last_success, config.created_at)
    {
        Decision::Run
    } else {
        Decision::Skip
    }
}

/// Whether a backup about to run is the last attempt allowed for its current failure streak —
/// either retries are disabled entirely, or this attempt would exhaust the retry budget.
/// `records` must be sorted newest-first.
pub fn is_last_attempt(config: &BackupConfig, records: &[BackupRecord]) -> bool {
    if !config.retry_enabled {
        return true;
    }
    let consecutive_failures = records
        .iter()
        .take_while(|r| r.status == BackupStatus::Failed)
        .count();
    consecutive_failures + 1 >= config.max_failed_tries as usize
}

/// Ids of completed backups whose artifacts have aged out of the configured retention window.
/// A `None` retention period means "keep forever".
pub fn expired_completed(
    records: &[BackupRecord],
    retention_period: Option<Duration>,
    now: DateTime<Utc>,
) -> Vec<Uuid> {
    let Some(period) = retention_period else {
        return Vec::new();
    };
    records
        .iter()
        .filter(|r| r.status == BackupStatus::Completed && now - r.created_at >= period)
        .map(|r| r.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupConfig, DatabaseEngine};
    use crate::record::EncryptionKind;
    use crate::schedule::Schedule;
    use chrono::{NaiveTime, TimeZone};
    use std::collections::HashSet;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 15, 18, 0, 0).unwrap()
    }

    fn base_config(now: DateTime<Utc>) -> BackupConfig {
        BackupConfig {
            enabled: true,
            database_id: Uuid::new_v4(),
            storage_id: Uuid::new_v4(),
            engine: DatabaseEngine::Postgres,
            retention_period: None,
            schedule: Schedule::Daily {
                time: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            },
            retry_enabled: true,
            max_failed_tries: 3,
            notification_subscriptions: HashSet::new(),
            encryption_kind: crate::config::DesiredEncryption::None,
            cpu_count_hint: 1,
            created_at: now - Duration::days(365),
        }
    }

    fn record(status: BackupStatus, created_at: DateTime<Utc>) -> BackupRecord {
        BackupRecord {
            id: Uuid::new_v4(),
            database_id: Uuid::new_v4(),
            storage_id: Uuid::new_v4(),
            status,
            size_mb: 1.0,
            duration_ms: 100,
            fail_message: None,
            encryption: EncryptionKind::None,
            encryption_salt: None,
            encryption_iv: None,
            created_at,
        }
    }

    #[test]
    fn disabled_config_never_runs() {
        let now = fixed_now();
        let mut config = base_config(now);
        config.enabled = false;
        assert_eq!(evaluate(&config, now, &[]), Decision::Skip);
    }

    #[test]
    fn in_progress_record_blocks_new_run() {
        let now = fixed_now();
        let config = base_config(now);
        let records = vec![record(BackupStatus::InProgress, now)];
        assert_eq!(evaluate(&config, now, &records), Decision::Skip);
    }

    #[test]
    fn retry_runs_while_under_budget() {
        let now = fixed_now();
        let config = base_config(now);
        let records = vec![record(BackupStatus::Failed, now - Duration::minutes(5))];
        assert_eq!(evaluate(&config, now, &records), Decision::Run);
    }

    #[test]
    fn retry_stops_once_budget_exhausted() {
        let now = fixed_now();
        let mut config = base_config(now);
        config.max_failed_tries = 2;
        // Today's scheduled instant (00:00) is already covered by a success at 01:00, so once
        // the retry budget is spent the schedule check below it also says "not due".
        let success_today = now.date_naive().and_hms_opt(1, 0, 0).unwrap();
        let records = vec![
            record(BackupStatus::Failed, now - Duration::minutes(1)),
            record(BackupStatus::Failed, now - Duration::minutes(2)),
            record(BackupStatus::Completed, Utc.from_utc_datetime(&success_today)),
        ];
        assert_eq!(evaluate(&config, now, &records), Decision::Skip);
    }

    #[test]
    fn retry_disabled_falls_through_to_schedule() {
        let now = fixed_now();
        let mut config = base_config(now);
        config.retry_enabled = false;
        let success_today = now.date_naive().and_hms_opt(1, 0, 0).unwrap();
        let records = vec![
            record(BackupStatus::Failed, now - Duration::minutes(5)),
            record(BackupStatus::Completed, Utc.from_utc_datetime(&success_today)),
        ];
        assert_eq!(evaluate(&config, now, &records), Decision::Skip);
    }

    #[test]
    fn expired_completed_respects_retention_period() {
        let now = fixed_now();
        let old = record(BackupStatus::Completed, now - Duration::days(31));
        let recent = record(BackupStatus::Completed, now - Duration::days(1));
        let expired = expired_completed(
            &[old.clone(), recent.clone()],
            Some(Duration::days(30)),
            now,
        );
        assert_eq!(expired, vec![old.id]);
    }

    #[test]
    fn keep_forever_never_expires() {
        let now = fixed_now();
        let old = record(BackupStatus::Completed, now - Duration::days(3650));
        assert!(expired_completed(&[old], None, now).is_empty());
    }
}
