//! In-process counters for the durable write path.
//!
//! Lock-free so they can be updated from the journal append and fsync paths
//! without measurable overhead. Error kinds are the one exception and sit
//! behind a mutex because fsync failures are rare.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default, Debug, Clone)]
pub struct StorageStatsSnapshot {
    pub journal_writes: u64,
    pub journal_bytes: u64,
    pub fsync_count: u64,
    pub fsync_total_us: u64,
    pub fsync_max_us: u64,
    pub fsync_errors: u64,
    pub fsync_errors_by_kind: BTreeMap<String, u64>,
    pub sync_lag_count: u64,
    pub sync_lag_total_us: u64,
    pub sync_lag_max_us: u64,
}

struct StorageStats {
    journal_writes: AtomicU64,
    journal_bytes: AtomicU64,
    fsync_count: AtomicU64,
    fsync_total_us: AtomicU64,
    fsync_max_us: AtomicU64,
    fsync_errors: AtomicU64,
    fsync_errors_by_kind: Mutex<BTreeMap<String, u64>>,
    sync_lag_count: AtomicU64,
    sync_lag_total_us: AtomicU64,
    sync_lag_max_us: AtomicU64,
}

impl StorageStats {
    const fn new() -> Self {
        Self {
            journal_writes: AtomicU64::new(0),
            journal_bytes: AtomicU64::new(0),
            fsync_count: AtomicU64::new(0),
            fsync_total_us: AtomicU64::new(0),
            fsync_max_us: AtomicU64::new(0),
            fsync_errors: AtomicU64::new(0),
            fsync_errors_by_kind: Mutex::new(BTreeMap::new()),
            sync_lag_count: AtomicU64::new(0),
            sync_lag_total_us: AtomicU64::new(0),
            sync_lag_max_us: AtomicU64::new(0),
        }
    }
}

static STORAGE_STATS: StorageStats = StorageStats::new();

fn as_us(dur: Duration) -> u64 {
    dur.as_micros().min(u128::from(u64::MAX)) as u64
}

pub(crate) fn record_write(bytes: usize) {
    STORAGE_STATS.journal_writes.fetch_add(1, Ordering::Relaxed);
    STORAGE_STATS
        .journal_bytes
        .fetch_add(bytes as u64, Ordering::Relaxed);
}

pub(crate) fn record_fsync(dur: Duration) {
    let us = as_us(dur);
    STORAGE_STATS.fsync_count.fetch_add(1, Ordering::Relaxed);
    STORAGE_STATS.fsync_total_us.fetch_add(us, Ordering::Relaxed);
    STORAGE_STATS.fsync_max_us.fetch_max(us, Ordering::Relaxed);
}

pub(crate) fn record_fsync_error(kind: ErrorKind) {
    STORAGE_STATS.fsync_errors.fetch_add(1, Ordering::Relaxed);
    let mut by_kind = STORAGE_STATS
        .fsync_errors_by_kind
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *by_kind.entry(format!("{kind:?}")).or_insert(0) += 1;
}

/// Records how far behind its configured period one grouped write was
/// resolved. Zero when the fsync landed within the period.
pub(crate) fn record_sync_lag(behind: Duration) {
    let us = as_us(behind);
    STORAGE_STATS.sync_lag_count.fetch_add(1, Ordering::Relaxed);
    STORAGE_STATS
        .sync_lag_total_us
        .fetch_add(us, Ordering::Relaxed);
    STORAGE_STATS
        .sync_lag_max_us
        .fetch_max(us, Ordering::Relaxed);
}

/// Point-in-time copy of all storage counters.
pub fn snapshot() -> StorageStatsSnapshot {
    let by_kind = STORAGE_STATS
        .fsync_errors_by_kind
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    StorageStatsSnapshot {
        journal_writes: STORAGE_STATS.journal_writes.load(Ordering::Relaxed),
        journal_bytes: STORAGE_STATS.journal_bytes.load(Ordering::Relaxed),
        fsync_count: STORAGE_STATS.fsync_count.load(Ordering::Relaxed),
        fsync_total_us: STORAGE_STATS.fsync_total_us.load(Ordering::Relaxed),
        fsync_max_us: STORAGE_STATS.fsync_max_us.load(Ordering::Relaxed),
        fsync_errors: STORAGE_STATS.fsync_errors.load(Ordering::Relaxed),
        fsync_errors_by_kind: by_kind,
        sync_lag_count: STORAGE_STATS.sync_lag_count.load(Ordering::Relaxed),
        sync_lag_total_us: STORAGE_STATS.sync_lag_total_us.load(Ordering::Relaxed),
        sync_lag_max_us: STORAGE_STATS.sync_lag_max_us.load(Ordering::Relaxed),
    }
}
