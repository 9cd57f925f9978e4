//! Cancellation registry (component C1).
//!
//! One [`CancellationToken`] per in-flight backup, the same primitive the teacher's tenant tasks
//! use to stop background work cooperatively. The registry just maps a backup id to its token;
//! every stage of the dump pipeline polls `is_cancelled()` between chunks of work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
    shutting_down: AtomicBool,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh token for `backup_id`, replacing any stale entry left behind by a prior
    /// run of the same id (can't happen in practice since ids are unique per backup, but keeps
    /// `register` idempotent rather than panicking on reuse).
    pub fn register(&self, backup_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().insert(backup_id, token.clone());
        token
    }

    /// Requests cancellation of `backup_id`. A backup that isn't registered (never started, or
    /// already finished) is treated as already-terminal: cancelling it is a no-op that still
    /// reports success.
    pub fn cancel(&self, backup_id: Uuid) {
        if let Some(token) = self.tokens.lock().get(&backup_id) {
            token.cancel();
        }
    }

    pub fn is_cancelled(&self, backup_id: Uuid) -> bool {
        self.tokens
            .lock()
            .get(&backup_id)
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    /// Drops the token once a backup reaches a terminal state, so the registry doesn't grow
    /// without bound over the service's lifetime.
    pub fn unregister(&self, backup_id: Uuid) {
        self.tokens.lock().remove(&backup_id);
    }

    /// Cancels every currently-registered scope and marks the registry as shutting down. A scope
    /// cancelled this way is distinct from an explicit [`Self::cancel`]: the orchestrator checks
    /// [`Self::is_shutting_down`] to tell the two apart and leaves the backup's record
    /// `IN_PROGRESS` for startup reconciliation rather than marking it `CANCELLED`.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for token in self.tokens.lock().values() {
            token.cancel();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}
