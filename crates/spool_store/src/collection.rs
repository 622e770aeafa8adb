//! The shared queue container: owns every named queue, routes the downstream
//! contract the session handler consumes, and replays journals at startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::oneshot;

use crate::journal::Journal;
use crate::queue::{PersistentQueue, QItem, QueueLimits};
use crate::sync_file::{StorageError, SyncPolicy};

const JOURNAL_EXT: &str = "journal";

const DEFAULT_MEMORY_LIMIT: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Directory for queue journals. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub sync_policy: SyncPolicy,
    pub limits: QueueLimits,
    /// Denominator for [`QueueCollection::reserved_memory_ratio`].
    pub memory_limit_bytes: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        CollectionConfig {
            data_dir: None,
            sync_policy: SyncPolicy::Never,
            limits: QueueLimits::default(),
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT,
        }
    }
}

/// Identifies one registered blocking waiter so it can be cancelled.
#[derive(Debug, Clone)]
pub struct WaiterToken {
    pub queue: String,
    pub id: u64,
}

/// Result of a fetch attempt against a queue.
pub enum RemoveOutcome {
    /// The queue answered immediately (item or empty).
    Ready(Option<QItem>),
    /// The queue was empty and the caller asked to block: await the receiver,
    /// cancel with the token.
    Wait(WaiterToken, oneshot::Receiver<QItem>),
}

pub struct QueueCollection {
    config: CollectionConfig,
    queues: Mutex<HashMap<String, Arc<Mutex<PersistentQueue>>>>,
    next_waiter_id: AtomicU64,
}

impl QueueCollection {
    /// Opens the collection, replaying any journals found in the data
    /// directory.
    pub fn open(config: CollectionConfig) -> anyhow::Result<Self> {
        let mut queues = HashMap::new();
        if let Some(dir) = &config.data_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create data dir {}", dir.display()))?;
            for entry in std::fs::read_dir(dir).context("scan data dir")? {
                let path = entry.context("read data dir entry")?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(JOURNAL_EXT) {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let ops = Journal::read_ops(&path)
                    .with_context(|| format!("replay journal {}", path.display()))?;
                let journal = Journal::open(&path, config.sync_policy)
                    .with_context(|| format!("open journal {}", path.display()))?;
                let mut queue = PersistentQueue::new(name, config.limits, Some(journal));
                queue
                    .replay(ops)
                    .with_context(|| format!("rebuild queue {name}"))?;
                tracing::info!(queue = name, items = queue.len(), "queue recovered from journal");
                queues.insert(name.to_string(), Arc::new(Mutex::new(queue)));
            }
        }
        Ok(QueueCollection {
            config,
            queues: Mutex::new(queues),
            next_waiter_id: AtomicU64::new(0),
        })
    }

    fn validate_name(name: &str) -> Result<(), StorageError> {
        if name.is_empty() || name.contains('/') {
            return Err(StorageError::InvalidQueueName(name.to_string()));
        }
        Ok(())
    }

    /// Returns the queue, creating it (and its journal) on first use.
    fn queue_handle(&self, name: &str) -> Result<Arc<Mutex<PersistentQueue>>, StorageError> {
        Self::validate_name(name)?;
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(queue) = queues.get(name) {
            return Ok(Arc::clone(queue));
        }
        let journal = match &self.config.data_dir {
            Some(dir) => {
                let path = dir.join(format!("{name}.{JOURNAL_EXT}"));
                Some(Journal::open(&path, self.config.sync_policy)?)
            }
            None => None,
        };
        let queue = Arc::new(Mutex::new(PersistentQueue::new(
            name,
            self.config.limits,
            journal,
        )));
        queues.insert(name.to_string(), Arc::clone(&queue));
        Ok(queue)
    }

    fn existing(&self, name: &str) -> Option<Arc<Mutex<PersistentQueue>>> {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
    }

    /// Appends an item, returning once the journal write is durable under
    /// the configured sync policy. False when the queue refused the item for
    /// capacity.
    pub async fn add(
        &self,
        queue: &str,
        data: Bytes,
        expiry: Option<SystemTime>,
        now: SystemTime,
        who: &str,
    ) -> Result<bool, StorageError> {
        let handle = self.queue_handle(queue)?;
        let receipt = {
            let mut q = handle.lock().unwrap_or_else(|p| p.into_inner());
            q.add(data, expiry, now)?
        };
        match receipt {
            None => {
                tracing::debug!(queue, who, "add refused for capacity");
                Ok(false)
            }
            Some(receipt) => {
                receipt.wait().await?;
                Ok(true)
            }
        }
    }

    /// Fetch attempt. With `wait` set and the queue empty, registers a
    /// blocking waiter instead of answering `None`.
    pub fn remove(
        &self,
        queue: &str,
        wait: bool,
        opening: bool,
        peeking: bool,
        who: &str,
    ) -> Result<RemoveOutcome, StorageError> {
        let handle = self.queue_handle(queue)?;
        let mut q = handle.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(item) = q.remove(opening, peeking, SystemTime::now())? {
            return Ok(RemoveOutcome::Ready(Some(item)));
        }
        if !wait {
            return Ok(RemoveOutcome::Ready(None));
        }
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue, who, waiter = id, "fetch blocked on empty queue");
        let rx = q.wait(id, opening, peeking);
        Ok(RemoveOutcome::Wait(
            WaiterToken {
                queue: queue.to_string(),
                id,
            },
            rx,
        ))
    }

    /// Deregisters a blocked waiter. False when it was already fulfilled.
    pub fn cancel_waiter(&self, token: &WaiterToken) -> bool {
        match self.existing(&token.queue) {
            Some(handle) => handle
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .cancel_waiter(token.id),
            None => false,
        }
    }

    /// Releases a reservation back to the head of its queue.
    pub fn unremove(&self, queue: &str, xid: u32) -> Result<bool, StorageError> {
        match self.existing(queue) {
            Some(handle) => handle
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .unremove(xid),
            None => Ok(false),
        }
    }

    /// Durably consumes a reservation.
    pub fn confirm_remove(&self, queue: &str, xid: u32) -> Result<bool, StorageError> {
        match self.existing(queue) {
            Some(handle) => handle.lock().unwrap_or_else(|p| p.into_inner()).confirm(xid),
            None => Ok(false),
        }
    }

    pub fn flush(&self, queue: &str, who: &str) -> Result<usize, StorageError> {
        match self.existing(queue) {
            Some(handle) => {
                let dropped = handle.lock().unwrap_or_else(|p| p.into_inner()).flush()?;
                tracing::info!(queue, who, dropped, "queue flushed");
                Ok(dropped)
            }
            None => Ok(0),
        }
    }

    pub fn flush_expired(&self, queue: &str, now: SystemTime) -> Result<usize, StorageError> {
        match self.existing(queue) {
            Some(handle) => handle
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .flush_expired(now),
            None => Ok(0),
        }
    }

    pub fn flush_all_expired(&self, now: SystemTime) -> usize {
        let mut total = 0;
        for name in self.queue_names() {
            match self.flush_expired(&name, now) {
                Ok(count) => total += count,
                Err(err) => {
                    tracing::warn!(queue = %name, error = %err, "expiry flush failed");
                }
            }
        }
        total
    }

    pub fn flush_everything(&self, who: &str) {
        for name in self.queue_names() {
            if let Err(err) = self.flush(&name, who) {
                tracing::warn!(queue = %name, error = %err, "flush failed");
            }
        }
    }

    /// Drops a queue and deletes its journal file. Blocked waiters observe a
    /// closed channel.
    pub async fn delete(&self, queue: &str, who: &str) -> Result<(), StorageError> {
        let removed = self
            .queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(queue);
        let Some(handle) = removed else {
            return Ok(());
        };
        let journal = {
            let q = handle.lock().unwrap_or_else(|p| p.into_inner());
            q.journal().cloned()
        };
        if let Some(journal) = journal {
            journal.delete().await?;
        }
        tracing::info!(queue, who, "queue deleted");
        Ok(())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Per-queue stats for queues that exist; `None` otherwise (a stats call
    /// must not create queues).
    pub fn stats(&self, queue: &str) -> Option<Vec<(String, String)>> {
        let handle = self.existing(queue)?;
        let q = handle.lock().unwrap_or_else(|p| p.into_inner());
        Some(q.stats(SystemTime::now()))
    }

    pub fn current_items(&self) -> usize {
        self.fold_queues(|q| q.len())
    }

    pub fn current_bytes(&self) -> u64 {
        self.fold_queues(|q| q.bytes() as usize) as u64
    }

    pub fn total_open_reads(&self) -> usize {
        self.fold_queues(|q| q.open_read_count())
    }

    /// Fraction of the configured memory budget held by queued payloads.
    pub fn reserved_memory_ratio(&self) -> f64 {
        let limit = self.config.memory_limit_bytes.max(1);
        self.current_bytes() as f64 / limit as f64
    }

    fn fold_queues(&self, f: impl Fn(&PersistentQueue) -> usize) -> usize {
        let queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        queues
            .values()
            .map(|handle| f(&handle.lock().unwrap_or_else(|p| p.into_inner())))
            .sum()
    }

    /// Final fsync and close of every journal.
    pub async fn close(&self) {
        let journals: Vec<Journal> = {
            let queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
            queues
                .values()
                .filter_map(|handle| {
                    handle
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .journal()
                        .cloned()
                })
                .collect()
        };
        for journal in journals {
            journal.close().await;
        }
    }
}
