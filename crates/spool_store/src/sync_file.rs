use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use crate::metrics;

/// Storage-level failure. `Clone` so one fsync error can be fanned out to
/// every write receipt that was covered by the failed sync.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("journal io failed ({kind:?}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
    #[error("storage is closed")]
    Closed,
    #[error("invalid queue name {0:?}")]
    InvalidQueueName(String),
}

impl StorageError {
    fn from_io(err: &std::io::Error) -> Self {
        StorageError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::from_io(&err)
    }
}

/// When the journal forces bytes to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// fsync after every single write; receipts resolve before `write` returns.
    Always,
    /// never fsync; receipts resolve immediately with no durability guarantee.
    Never,
    /// fsync at most once per period; all writes enqueued before an fsync
    /// starts are acknowledged together, in write order.
    Periodic(Duration),
}

impl SyncPolicy {
    /// `0` syncs every write, negative never syncs, anything else is the
    /// grouped period in milliseconds.
    pub fn from_period_ms(ms: i64) -> Self {
        if ms == 0 {
            SyncPolicy::Always
        } else if ms < 0 {
            SyncPolicy::Never
        } else {
            SyncPolicy::Periodic(Duration::from_millis(ms as u64))
        }
    }
}

/// Handle resolved once the bytes of one `write` call are durable (or were
/// never going to be, under [`SyncPolicy::Never`]).
#[derive(Debug)]
pub struct SyncReceipt(Option<oneshot::Receiver<Result<(), StorageError>>>);

impl SyncReceipt {
    pub(crate) fn ready() -> Self {
        SyncReceipt(None)
    }

    pub fn is_ready(&self) -> bool {
        self.0.is_none()
    }

    pub async fn wait(self) -> Result<(), StorageError> {
        match self.0 {
            None => Ok(()),
            Some(rx) => match rx.await {
                Ok(res) => res,
                Err(_) => Err(StorageError::Closed),
            },
        }
    }
}

struct Promise {
    tx: oneshot::Sender<Result<(), StorageError>>,
    enqueued_at: Instant,
}

struct Shared {
    file: Mutex<Option<File>>,
    policy: SyncPolicy,
    promises: Mutex<VecDeque<Promise>>,
    // Serializes fsync against itself; writes are allowed to proceed while an
    // fsync is in flight.
    fsync_gate: tokio::sync::Mutex<()>,
    timer_running: AtomicBool,
    closed: AtomicBool,
    appended_bytes: AtomicU64,
}

/// Append-only file whose writes are acknowledged according to a
/// [`SyncPolicy`]. Cheap to clone; all clones share the same file and
/// promise queue.
#[derive(Clone)]
pub struct PeriodicSyncFile {
    shared: Arc<Shared>,
}

impl PeriodicSyncFile {
    pub fn open(path: &Path, policy: SyncPolicy) -> Result<Self, StorageError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(PeriodicSyncFile {
            shared: Arc::new(Shared {
                file: Mutex::new(Some(file)),
                policy,
                promises: Mutex::new(VecDeque::new()),
                fsync_gate: tokio::sync::Mutex::new(()),
                timer_running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                appended_bytes: AtomicU64::new(len),
            }),
        })
    }

    /// Appends the whole buffer and returns a receipt that resolves once the
    /// bytes are covered by an fsync (per policy). Blocks the calling task
    /// for the write itself, and for the fsync too under
    /// [`SyncPolicy::Always`].
    pub fn write(&self, buf: &[u8]) -> Result<SyncReceipt, StorageError> {
        let shared = &self.shared;
        {
            let mut guard = shared.file.lock().unwrap_or_else(|p| p.into_inner());
            let Some(file) = guard.as_mut() else {
                return Err(StorageError::Closed);
            };
            file.write_all(buf)?;
            match shared.policy {
                SyncPolicy::Always => {
                    let started = Instant::now();
                    let res = file.sync_data();
                    metrics::record_fsync(started.elapsed());
                    if let Err(err) = res {
                        metrics::record_fsync_error(err.kind());
                        return Err(err.into());
                    }
                }
                SyncPolicy::Never | SyncPolicy::Periodic(_) => {}
            }
        }
        metrics::record_write(buf.len());
        shared
            .appended_bytes
            .fetch_add(buf.len() as u64, Ordering::Relaxed);

        match shared.policy {
            SyncPolicy::Always | SyncPolicy::Never => Ok(SyncReceipt::ready()),
            SyncPolicy::Periodic(period) => {
                let (tx, rx) = oneshot::channel();
                shared
                    .promises
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push_back(Promise {
                        tx,
                        enqueued_at: Instant::now(),
                    });
                Shared::ensure_timer(shared, period);
                Ok(SyncReceipt(Some(rx)))
            }
        }
    }

    /// Bytes appended since the file was opened (plus any pre-existing
    /// length). Reset by [`truncate`](Self::truncate).
    pub fn len(&self) -> u64 {
        self.shared.appended_bytes.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewinds the file to zero length in place. Outstanding receipts stay
    /// queued and resolve on the next fsync as usual.
    pub fn truncate(&self) -> Result<(), StorageError> {
        let guard = self.shared.file.lock().unwrap_or_else(|p| p.into_inner());
        let Some(file) = guard.as_ref() else {
            return Err(StorageError::Closed);
        };
        file.set_len(0)?;
        self.shared.appended_bytes.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Forces an fsync now, resolving every receipt enqueued before it
    /// started.
    pub async fn sync(&self) {
        Shared::run_fsync(&self.shared).await;
    }

    /// Stops the periodic timer, runs a final fsync, and closes the handle.
    /// Runs at most once; later calls are no-ops. Writes racing `close` are
    /// undefined and will observe either the open or the closed file.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        Shared::run_fsync(&self.shared).await;
        let mut guard = self.shared.file.lock().unwrap_or_else(|p| p.into_inner());
        *guard = None;
    }
}

impl Shared {
    fn ensure_timer(shared: &Arc<Shared>, period: Duration) {
        if shared.timer_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; the first sync should wait a period.
            tick.tick().await;
            loop {
                tick.tick().await;
                if shared.closed.load(Ordering::Acquire) {
                    break;
                }
                Shared::run_fsync(&shared).await;
                let drained = shared
                    .promises
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .is_empty();
                if drained {
                    shared.timer_running.store(false, Ordering::Release);
                    // A write may have enqueued between the drain check and
                    // the flag clear without starting its own timer. Reclaim
                    // the timer in that case, otherwise stop.
                    let raced = !shared
                        .promises
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .is_empty();
                    if raced && !shared.timer_running.swap(true, Ordering::AcqRel) {
                        continue;
                    }
                    break;
                }
            }
        });
    }

    async fn run_fsync(shared: &Arc<Shared>) {
        let _gate = shared.fsync_gate.lock().await;
        let started = Instant::now();
        // Snapshot before forcing: writes that land while the fsync is in
        // flight are not covered by it and must wait for the next round.
        // Under-counting here is fine, over-counting would ack bytes that
        // were never forced.
        let completed = shared
            .promises
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len();
        if completed == 0 {
            return;
        }

        let dup = {
            let guard = shared.file.lock().unwrap_or_else(|p| p.into_inner());
            match guard.as_ref() {
                Some(file) => file.try_clone(),
                None => return,
            }
        };
        let res = match dup {
            Ok(file) => tokio::task::spawn_blocking(move || file.sync_data())
                .await
                .unwrap_or_else(|join_err| {
                    Err(std::io::Error::other(format!(
                        "fsync task failed: {join_err}"
                    )))
                }),
            Err(err) => Err(err),
        };
        metrics::record_fsync(started.elapsed());

        let period = match shared.policy {
            SyncPolicy::Periodic(p) => p,
            _ => Duration::ZERO,
        };
        let mut promises = shared.promises.lock().unwrap_or_else(|p| p.into_inner());
        match res {
            Ok(()) => {
                for _ in 0..completed {
                    let Some(promise) = promises.pop_front() else {
                        break;
                    };
                    let behind = started
                        .saturating_duration_since(promise.enqueued_at)
                        .saturating_sub(period);
                    metrics::record_sync_lag(behind);
                    let _ = promise.tx.send(Ok(()));
                }
            }
            Err(err) => {
                metrics::record_fsync_error(err.kind());
                tracing::warn!(error = %err, "journal fsync failed");
                let storage_err = StorageError::from_io(&err);
                for _ in 0..completed {
                    let Some(promise) = promises.pop_front() else {
                        break;
                    };
                    let _ = promise.tx.send(Err(storage_err.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
        dir.path().join(name)
    }

    #[tokio::test]
    async fn always_mode_resolves_inline() {
        let dir = tempfile::tempdir().unwrap();
        let file =
            PeriodicSyncFile::open(&temp_path(&dir, "a.journal"), SyncPolicy::Always).unwrap();
        let receipt = file.write(b"hello").unwrap();
        assert!(receipt.is_ready());
        receipt.wait().await.unwrap();
        assert_eq!(std::fs::read(temp_path(&dir, "a.journal")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn never_mode_resolves_inline() {
        let dir = tempfile::tempdir().unwrap();
        let file =
            PeriodicSyncFile::open(&temp_path(&dir, "n.journal"), SyncPolicy::Never).unwrap();
        let receipt = file.write(b"bytes").unwrap();
        assert!(receipt.is_ready());
        receipt.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn grouped_mode_acks_in_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = PeriodicSyncFile::open(
            &temp_path(&dir, "g.journal"),
            SyncPolicy::Periodic(Duration::from_millis(50)),
        )
        .unwrap();

        let r1 = file.write(b"w1").unwrap();
        let r2 = file.write(b"w2").unwrap();
        let r3 = file.write(b"w3").unwrap();
        assert!(!r1.is_ready());

        // All three were enqueued before the first fsync tick; they must all
        // resolve on that tick, oldest first.
        r1.wait().await.unwrap();
        r2.wait().await.unwrap();
        r3.wait().await.unwrap();
        assert_eq!(
            std::fs::read(temp_path(&dir, "g.journal")).unwrap(),
            b"w1w2w3"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn write_enqueued_after_drain_still_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let file = PeriodicSyncFile::open(
            &temp_path(&dir, "d.journal"),
            SyncPolicy::Periodic(Duration::from_millis(20)),
        )
        .unwrap();

        file.write(b"first").unwrap().wait().await.unwrap();
        // Timer may have parked after the drain; the next write must restart it.
        file.write(b"second").unwrap().wait().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let file = PeriodicSyncFile::open(
            &temp_path(&dir, "c.journal"),
            SyncPolicy::Periodic(Duration::from_millis(50)),
        )
        .unwrap();
        let receipt = file.write(b"pending").unwrap();
        file.close().await;
        file.close().await;
        // The final fsync covers writes queued before close.
        receipt.wait().await.unwrap();
        assert!(matches!(
            file.write(b"late"),
            Err(StorageError::Closed)
        ));
    }

    #[tokio::test]
    async fn truncate_rewinds_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let file =
            PeriodicSyncFile::open(&temp_path(&dir, "t.journal"), SyncPolicy::Always).unwrap();
        file.write(b"old-contents").unwrap();
        file.truncate().unwrap();
        assert!(file.is_empty());
        file.write(b"new").unwrap();
        assert_eq!(std::fs::read(temp_path(&dir, "t.journal")).unwrap(), b"new");
    }
}
