//! Backend implementations behind [`crate::Connection`].

pub(crate) mod cache;
pub(crate) mod mysql;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Per-connection bookkeeping shared by the backends: elapsed driver time,
/// the last insert id seen, the connect-failure latch and the transaction
/// flag.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    database_time_us: AtomicU64,
    last_insert_id: AtomicU64,
    failed: AtomicBool,
    in_transaction: AtomicBool,
}

impl Stats {
    pub fn add_time(&self, elapsed: Duration) {
        self.database_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn database_time(&self) -> Duration {
        Duration::from_micros(self.database_time_us.load(Ordering::Relaxed))
    }

    pub fn record_insert_id(&self, id: u64) {
        if id != 0 {
            self.last_insert_id.store(id, Ordering::Relaxed);
        }
    }

    pub fn last_insert_id(&self) -> Option<u64> {
        match self.last_insert_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn latch_failure(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    pub fn clear_failure(&self) {
        self.failed.store(false, Ordering::Relaxed);
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn enter_transaction(&self) {
        self.in_transaction.store(true, Ordering::Relaxed);
    }

    pub fn leave_transaction(&self) -> bool {
        self.in_transaction.swap(false, Ordering::Relaxed)
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Relaxed)
    }
}
