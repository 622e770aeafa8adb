//! Per-session command surface: reliable-read bookkeeping, waiter tracking,
//! availability gating, and rollback on disconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::availability::{Availability, ServerStatus, Status};
use crate::config::RuntimeTunables;
use crate::metrics;
use crate::pending_reads::PendingReadSet;
use crate::server::ShutdownHandle;
use spool_store::{QItem, QueueCollection, RemoveOutcome, StorageError, WaiterToken};

/// Session-level failures, mapped to wire verbs by the protocol adapter.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Protocol(String),
    #[error("an open read is already pending on {queue:?}")]
    TransactionViolation { queue: String },
    #[error("too many open reads on {queue:?}")]
    TooManyOpenReads { queue: String },
    #[error("server refusing {op}s")]
    Unavailable { op: &'static str },
    #[error("no server status configured")]
    StatusNotConfigured,
    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidQueueName(name) => {
                SessionError::Protocol(format!("invalid queue name {name:?}"))
            }
            other => SessionError::Storage(other),
        }
    }
}

pub struct SessionHandler {
    id: u64,
    description: String,
    queues: Arc<QueueCollection>,
    status: Option<Arc<ServerStatus>>,
    availability: Availability,
    tunables: Arc<RuntimeTunables>,
    pending: PendingReadSet,
    waiters: Mutex<HashMap<u64, WaiterToken>>,
    finished: AtomicBool,
    shutdown: ShutdownHandle,
    shutdown_delay: Duration,
}

impl SessionHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        client: &str,
        queues: Arc<QueueCollection>,
        status: Option<Arc<ServerStatus>>,
        availability: Availability,
        tunables: Arc<RuntimeTunables>,
        shutdown: ShutdownHandle,
        shutdown_delay: Duration,
    ) -> Self {
        SessionHandler {
            id,
            description: format!("session:{id}:{client}"),
            queues,
            status,
            availability,
            tunables,
            pending: PendingReadSet::new(),
            waiters: Mutex::new(HashMap::new()),
            finished: AtomicBool::new(false),
            shutdown,
            shutdown_delay,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn queues(&self) -> &QueueCollection {
        &self.queues
    }

    pub fn tunables(&self) -> &RuntimeTunables {
        &self.tunables
    }

    fn max_open_reads(&self) -> usize {
        self.tunables.max_open_reads()
    }

    fn reads_admitted(&self) -> bool {
        if self.availability.refuse_reads {
            return false;
        }
        match &self.status {
            Some(status) => !status.current().blocks_reads(),
            None => true,
        }
    }

    fn writes_admitted(&self) -> bool {
        if self.availability.refuse_writes {
            return false;
        }
        match &self.status {
            Some(status) => !status.current().blocks_writes(),
            None => true,
        }
    }

    fn gate_read(&self, op: &'static str) -> Result<(), SessionError> {
        if self.reads_admitted() {
            Ok(())
        } else {
            metrics::record_unavailable();
            Err(SessionError::Unavailable { op })
        }
    }

    fn gate_write(&self, op: &'static str) -> Result<(), SessionError> {
        if self.writes_admitted() {
            Ok(())
        } else {
            metrics::record_unavailable();
            Err(SessionError::Unavailable { op })
        }
    }

    /// Appends an item; false when the queue refused it for capacity. The
    /// call returns once the journal write is durable under the configured
    /// sync policy.
    pub async fn set_item(
        &self,
        queue: &str,
        expiry: Option<SystemTime>,
        data: Bytes,
    ) -> Result<bool, SessionError> {
        self.gate_write("set")?;
        metrics::record_cmd_set();
        let started = Instant::now();
        let stored = self
            .queues
            .add(queue, data, expiry, SystemTime::now(), &self.description)
            .await?;
        metrics::record_set_latency(queue, started.elapsed());
        Ok(stored)
    }

    /// Fetches one item. `opening` reserves it under a reliable-read xid;
    /// `peeking` copies the head without consuming. With a timeout, blocks
    /// until an item arrives or the deadline passes.
    pub async fn get_item(
        &self,
        queue: &str,
        timeout: Option<Duration>,
        opening: bool,
        peeking: bool,
    ) -> Result<Option<QItem>, SessionError> {
        self.gate_read("get")?;
        if opening && self.pending.total() >= self.max_open_reads() {
            return Err(SessionError::TooManyOpenReads {
                queue: queue.to_string(),
            });
        }
        if !opening && !peeking && self.pending.size(queue) > 0 {
            return Err(SessionError::TransactionViolation {
                queue: queue.to_string(),
            });
        }
        if peeking {
            metrics::record_cmd_peek();
        } else {
            metrics::record_cmd_get();
        }

        let started = Instant::now();
        let outcome =
            self.queues
                .remove(queue, timeout.is_some(), opening, peeking, &self.description)?;
        let fetched = match outcome {
            RemoveOutcome::Ready(item) => item,
            RemoveOutcome::Wait(token, mut rx) => {
                self.register_waiter(&token);
                let deadline =
                    tokio::time::Instant::now() + timeout.unwrap_or(Duration::ZERO);
                let fetched = tokio::select! {
                    res = &mut rx => res.ok(),
                    _ = tokio::time::sleep_until(deadline) => {
                        if self.queues.cancel_waiter(&token) {
                            None
                        } else {
                            // Fulfilment raced the deadline. The queue already
                            // committed the hand-off, so take the item rather
                            // than leak its reservation.
                            rx.await.ok()
                        }
                    }
                };
                self.deregister_waiter(&token);
                fetched
            }
        };
        metrics::record_get_latency(started.elapsed());

        if let Some(item) = &fetched {
            if opening {
                self.pending.add(queue, item.xid);
                if self.finished.load(Ordering::Acquire) {
                    // The session finished while the fetch was in flight.
                    // Admit the xid, then roll everything back so the item
                    // is not leaked.
                    metrics::record_item_opened_after_finish();
                    let cancelled = self.pending.cancel_all(&self.queues);
                    tracing::warn!(
                        session = self.id,
                        queue,
                        cancelled,
                        "item opened after session finish, rolled back"
                    );
                    return Ok(None);
                }
            }
        }
        Ok(fetched)
    }

    /// Aborts the oldest open read on the queue, returning the item to the
    /// head. False (with a warning) when nothing was pending.
    pub fn abort_read(&self, queue: &str) -> Result<bool, SessionError> {
        match self.pending.pop(queue) {
            Some(xid) => {
                self.queues.unremove(queue, xid)?;
                Ok(true)
            }
            None => {
                tracing::warn!(session = self.id, queue, "abort with no open read");
                Ok(false)
            }
        }
    }

    /// Confirms the oldest open read on the queue.
    pub fn close_read(&self, queue: &str) -> Result<bool, SessionError> {
        Ok(self.close_reads(queue, 1)?)
    }

    /// Confirms up to `n` of the oldest open reads; true when at least one
    /// was confirmed.
    pub fn close_reads(&self, queue: &str, n: usize) -> Result<bool, SessionError> {
        let mut confirmed = false;
        for xid in self.pending.pop_n(queue, n) {
            self.queues.confirm_remove(queue, xid)?;
            confirmed = true;
        }
        Ok(confirmed)
    }

    /// Streams items into `sink` until the deadline, the item cap, the open
    /// read cap, a drained queue, or an availability block ends the stream.
    /// Closing the sink signals end-of-stream to the caller.
    pub async fn monitor_until(
        &self,
        queue: &str,
        deadline: tokio::time::Instant,
        max_items: usize,
        opening: bool,
        sink: mpsc::Sender<QItem>,
    ) -> Result<(), SessionError> {
        self.gate_read("monitor")?;
        metrics::record_cmd_monitor();
        let mut delivered = 0;
        while delivered < max_items {
            if !self.reads_admitted() {
                break;
            }
            if opening && self.pending.total() >= self.max_open_reads() {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            match self.get_item(queue, Some(remaining), opening, false).await? {
                Some(item) => {
                    if sink.send(item).await.is_err() {
                        break;
                    }
                    delivered += 1;
                }
                None => break,
            }
        }
        Ok(())
    }

    pub fn flush(&self, queue: &str) -> Result<(), SessionError> {
        self.gate_write("flush")?;
        self.queues.flush(queue, &self.description)?;
        Ok(())
    }

    pub fn flush_expired(&self, queue: &str) -> Result<usize, SessionError> {
        self.gate_write("flush")?;
        Ok(self.queues.flush_expired(queue, SystemTime::now())?)
    }

    pub fn flush_all_expired(&self) -> Result<usize, SessionError> {
        self.gate_write("flush")?;
        Ok(self.queues.flush_all_expired(SystemTime::now()))
    }

    pub fn flush_all_queues(&self) -> Result<(), SessionError> {
        self.gate_write("flush")?;
        self.queues.flush_everything(&self.description);
        Ok(())
    }

    pub async fn delete_queue(&self, queue: &str) -> Result<(), SessionError> {
        self.gate_write("delete")?;
        self.queues.delete(queue, &self.description).await?;
        Ok(())
    }

    fn configured_status(&self) -> Result<&ServerStatus, SessionError> {
        self.status
            .as_deref()
            .ok_or(SessionError::StatusNotConfigured)
    }

    pub fn current_status(&self) -> Result<&'static str, SessionError> {
        Ok(self.configured_status()?.current().as_str())
    }

    pub fn set_status(&self, raw: &str) -> Result<(), SessionError> {
        let status = self.configured_status()?;
        match Status::parse(raw) {
            Some(new_status) => {
                status.set(new_status);
                Ok(())
            }
            None => Err(SessionError::Protocol(format!("unknown status {raw:?}"))),
        }
    }

    /// Schedules a server-wide shutdown after a short delay so the response
    /// to this command can flush first.
    pub fn shutdown(&self) {
        tracing::info!(session = self.id, "shutdown requested");
        let handle = self.shutdown.clone();
        let delay = self.shutdown_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.trigger();
        });
    }

    fn register_waiter(&self, token: &WaiterToken) {
        {
            let mut waiters = self.waiters.lock().unwrap_or_else(|p| p.into_inner());
            waiters.insert(token.id, token.clone());
        }
        // finish() may have drained the map just before the insert; take the
        // waiter back out and cancel it ourselves in that case.
        if self.finished.load(Ordering::Acquire) {
            let reclaimed = self
                .waiters
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&token.id);
            if reclaimed.is_some() {
                self.queues.cancel_waiter(token);
            }
        }
    }

    fn deregister_waiter(&self, token: &WaiterToken) {
        self.waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&token.id);
    }

    /// Idempotent teardown: cancels every in-flight fetch and rolls back
    /// every open read. Called when the transport drops the connection.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let waiters: Vec<WaiterToken> = {
            let mut map = self.waiters.lock().unwrap_or_else(|p| p.into_inner());
            map.drain().map(|(_, token)| token).collect()
        };
        for token in &waiters {
            self.queues.cancel_waiter(token);
        }
        let cancelled = self.pending.cancel_all(&self.queues);
        if cancelled > 0 || !waiters.is_empty() {
            tracing::debug!(
                session = self.id,
                open_reads = cancelled,
                waiters = waiters.len(),
                "session finished with work outstanding"
            );
        }
        metrics::session_closed();
    }
}
