use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::journal::{Journal, JournalOp};
use crate::sync_file::{StorageError, SyncReceipt};

/// One queued payload. `xid` is zero until the item is reserved by an
/// opening read.
#[derive(Debug, Clone)]
pub struct QItem {
    pub data: Bytes,
    pub xid: u32,
    pub expiry: Option<SystemTime>,
    pub added_at: SystemTime,
}

impl QItem {
    fn is_expired(&self, now: SystemTime) -> bool {
        match self.expiry {
            Some(at) => at <= now,
            None => false,
        }
    }
}

/// Per-queue capacity limits. Zero disables a limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueLimits {
    pub max_items: usize,
    pub max_item_size: usize,
}

pub(crate) struct WaiterEntry {
    id: u64,
    opening: bool,
    peeking: bool,
    tx: oneshot::Sender<QItem>,
}

/// FIFO queue with reliable-read reservations, blocking waiters, and an
/// optional journal. All methods run under the owning collection's lock for
/// this queue.
pub(crate) struct PersistentQueue {
    name: String,
    items: VecDeque<QItem>,
    bytes: u64,
    open_reads: HashMap<u32, QItem>,
    waiters: VecDeque<WaiterEntry>,
    next_xid: u32,
    journal: Option<Journal>,
    limits: QueueLimits,
    total_items: u64,
    total_expired: u64,
    total_discarded: u64,
}

impl PersistentQueue {
    pub fn new(name: &str, limits: QueueLimits, journal: Option<Journal>) -> Self {
        PersistentQueue {
            name: name.to_string(),
            items: VecDeque::new(),
            bytes: 0,
            open_reads: HashMap::new(),
            waiters: VecDeque::new(),
            next_xid: 0,
            journal,
            limits,
            total_items: 0,
            total_expired: 0,
            total_discarded: 0,
        }
    }

    /// Rebuilds in-memory state from replayed journal ops. Reservations left
    /// by a previous process are rolled back to the head afterwards, oldest
    /// xid first, so FIFO order is preserved across a crash.
    pub fn replay(&mut self, ops: Vec<JournalOp>) -> Result<(), StorageError> {
        for op in ops {
            match op {
                JournalOp::Add { expiry_ms, data } => {
                    self.bytes += data.len() as u64;
                    self.total_items += 1;
                    self.items.push_back(QItem {
                        data,
                        xid: 0,
                        expiry: JournalOp::expiry_time(expiry_ms),
                        added_at: SystemTime::now(),
                    });
                }
                JournalOp::Remove => {
                    if let Some(item) = self.items.pop_front() {
                        self.bytes -= item.data.len() as u64;
                    }
                }
                JournalOp::Open { xid } => {
                    if let Some(mut item) = self.items.pop_front() {
                        self.bytes -= item.data.len() as u64;
                        item.xid = xid;
                        self.open_reads.insert(xid, item);
                    }
                    self.next_xid = self.next_xid.max(xid);
                }
                JournalOp::Confirm { xid } => {
                    self.open_reads.remove(&xid);
                }
                JournalOp::Unremove { xid } => {
                    if let Some(item) = self.open_reads.remove(&xid) {
                        self.bytes += item.data.len() as u64;
                        self.items.push_front(item);
                    }
                }
                JournalOp::Flush => {
                    self.items.clear();
                    self.bytes = 0;
                }
            }
        }

        let mut orphaned: Vec<u32> = self.open_reads.keys().copied().collect();
        orphaned.sort_unstable_by(|a, b| b.cmp(a));
        for xid in orphaned {
            self.unremove(xid)?;
        }
        Ok(())
    }

    fn journal_op(&self, op: &JournalOp) -> Result<(), StorageError> {
        if let Some(journal) = &self.journal {
            // Only add receipts are awaited; state ops ride the same fsync
            // schedule without a waiter.
            let _ = journal.append(op)?;
        }
        Ok(())
    }

    /// Discards expired items from the head. Items deeper in the queue
    /// expire when they reach the head, which keeps the journal a pure
    /// head/tail log.
    fn discard_expired(&mut self, now: SystemTime) -> Result<usize, StorageError> {
        let mut dropped = 0;
        while matches!(self.items.front(), Some(item) if item.is_expired(now)) {
            let item = self.items.pop_front().unwrap();
            self.bytes -= item.data.len() as u64;
            self.total_expired += 1;
            dropped += 1;
            self.journal_op(&JournalOp::Remove)?;
        }
        if dropped > 0 {
            self.maybe_truncate();
        }
        Ok(dropped)
    }

    /// Appends an item. Returns the journal receipt when stored, `None` when
    /// the queue refused it for capacity.
    pub fn add(
        &mut self,
        data: Bytes,
        expiry: Option<SystemTime>,
        now: SystemTime,
    ) -> Result<Option<SyncReceipt>, StorageError> {
        if self.limits.max_item_size > 0 && data.len() > self.limits.max_item_size {
            self.total_discarded += 1;
            return Ok(None);
        }
        if self.limits.max_items > 0 && self.items.len() >= self.limits.max_items {
            self.total_discarded += 1;
            return Ok(None);
        }

        let receipt = match &self.journal {
            Some(journal) => Some(journal.append(&JournalOp::add(data.clone(), expiry))?),
            None => None,
        };
        self.bytes += data.len() as u64;
        self.total_items += 1;
        self.items.push_back(QItem {
            data,
            xid: 0,
            expiry,
            added_at: now,
        });
        self.dispatch_to_waiters()?;
        Ok(Some(receipt.unwrap_or_else(SyncReceipt::ready)))
    }

    /// Hands queued items to blocked waiters in arrival order. Peeking
    /// waiters receive a copy without consuming; the first consuming waiter
    /// takes the head. A waiter whose receiver is already gone is skipped and
    /// any reservation made for it is rolled back.
    fn dispatch_to_waiters(&mut self) -> Result<(), StorageError> {
        while !self.waiters.is_empty() && !self.items.is_empty() {
            let entry = self.waiters.pop_front().unwrap();
            if entry.peeking {
                let copy = self.items.front().unwrap().clone();
                let _ = entry.tx.send(copy);
                continue;
            }

            let mut item = self.items.pop_front().unwrap();
            self.bytes -= item.data.len() as u64;
            if entry.opening {
                self.next_xid = self.next_xid.wrapping_add(1);
                item.xid = self.next_xid;
                self.open_reads.insert(item.xid, item.clone());
                match entry.tx.send(item) {
                    Ok(()) => {
                        self.journal_op(&JournalOp::Open { xid: self.next_xid })?;
                    }
                    Err(item) => {
                        self.open_reads.remove(&item.xid);
                        self.restore_front(item);
                    }
                }
            } else {
                match entry.tx.send(item) {
                    Ok(()) => {
                        self.journal_op(&JournalOp::Remove)?;
                        self.maybe_truncate();
                    }
                    Err(item) => self.restore_front(item),
                }
            }
        }
        Ok(())
    }

    fn restore_front(&mut self, mut item: QItem) {
        item.xid = 0;
        self.bytes += item.data.len() as u64;
        self.items.push_front(item);
    }

    /// Immediate fetch attempt. Expired heads are dropped first.
    pub fn remove(
        &mut self,
        opening: bool,
        peeking: bool,
        now: SystemTime,
    ) -> Result<Option<QItem>, StorageError> {
        self.discard_expired(now)?;
        if peeking {
            return Ok(self.items.front().cloned());
        }
        let Some(mut item) = self.items.pop_front() else {
            return Ok(None);
        };
        self.bytes -= item.data.len() as u64;
        if opening {
            self.next_xid = self.next_xid.wrapping_add(1);
            item.xid = self.next_xid;
            self.open_reads.insert(item.xid, item.clone());
            self.journal_op(&JournalOp::Open { xid: item.xid })?;
        } else {
            self.journal_op(&JournalOp::Remove)?;
            self.maybe_truncate();
        }
        Ok(Some(item))
    }

    /// Registers a blocked waiter and returns its receiver.
    pub fn wait(&mut self, id: u64, opening: bool, peeking: bool) -> oneshot::Receiver<QItem> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(WaiterEntry {
            id,
            opening,
            peeking,
            tx,
        });
        rx
    }

    /// Removes a registered waiter. False when the waiter was already
    /// fulfilled (or never registered here).
    pub fn cancel_waiter(&mut self, id: u64) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|entry| entry.id != id);
        self.waiters.len() != before
    }

    /// Releases a reservation back to the head of the queue.
    pub fn unremove(&mut self, xid: u32) -> Result<bool, StorageError> {
        let Some(mut item) = self.open_reads.remove(&xid) else {
            return Ok(false);
        };
        self.journal_op(&JournalOp::Unremove { xid })?;
        item.xid = 0;
        self.bytes += item.data.len() as u64;
        self.items.push_front(item);
        self.dispatch_to_waiters()?;
        Ok(true)
    }

    /// Durably consumes a reservation.
    pub fn confirm(&mut self, xid: u32) -> Result<bool, StorageError> {
        if self.open_reads.remove(&xid).is_none() {
            return Ok(false);
        }
        self.journal_op(&JournalOp::Confirm { xid })?;
        self.maybe_truncate();
        Ok(true)
    }

    /// Drops every queued item; reservations stay open.
    pub fn flush(&mut self) -> Result<usize, StorageError> {
        let dropped = self.items.len();
        if dropped > 0 {
            self.journal_op(&JournalOp::Flush)?;
        }
        self.items.clear();
        self.bytes = 0;
        self.maybe_truncate();
        Ok(dropped)
    }

    pub fn flush_expired(&mut self, now: SystemTime) -> Result<usize, StorageError> {
        self.discard_expired(now)
    }

    /// When the queue is fully drained the journal no longer encodes any
    /// state and can be rewound in place.
    fn maybe_truncate(&mut self) {
        if self.items.is_empty() && self.open_reads.is_empty() {
            if let Some(journal) = &self.journal {
                if !journal.is_empty() {
                    if let Err(err) = journal.truncate() {
                        tracing::warn!(queue = %self.name, error = %err, "journal truncate failed");
                    }
                }
            }
        }
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn open_read_count(&self) -> usize {
        self.open_reads.len()
    }

    pub fn stats(&self, now: SystemTime) -> Vec<(String, String)> {
        let age_ms = self
            .items
            .front()
            .and_then(|item| now.duration_since(item.added_at).ok())
            .map(|age| age.as_millis().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(0);
        vec![
            ("items".into(), self.items.len().to_string()),
            ("bytes".into(), self.bytes.to_string()),
            ("total_items".into(), self.total_items.to_string()),
            ("expired_items".into(), self.total_expired.to_string()),
            ("discarded".into(), self.total_discarded.to_string()),
            (
                "open_transactions".into(),
                self.open_reads.len().to_string(),
            ),
            ("waiters".into(), self.waiters.len().to_string()),
            ("age_msec".into(), age_ms.to_string()),
            (
                "journal_size".into(),
                self.journal
                    .as_ref()
                    .map(|j| j.len())
                    .unwrap_or(0)
                    .to_string(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn mem_queue() -> PersistentQueue {
        PersistentQueue::new("test", QueueLimits::default(), None)
    }

    fn add(q: &mut PersistentQueue, data: &'static [u8]) {
        let stored = q
            .add(Bytes::from_static(data), None, SystemTime::now())
            .unwrap();
        assert!(stored.is_some());
    }

    #[test]
    fn fifo_order() {
        let mut q = mem_queue();
        add(&mut q, b"a");
        add(&mut q, b"b");
        add(&mut q, b"c");
        let now = SystemTime::now();
        assert_eq!(q.remove(false, false, now).unwrap().unwrap().data, "a");
        assert_eq!(q.remove(false, false, now).unwrap().unwrap().data, "b");
        assert_eq!(q.remove(false, false, now).unwrap().unwrap().data, "c");
        assert!(q.remove(false, false, now).unwrap().is_none());
    }

    #[test]
    fn open_then_unremove_restores_head() {
        let mut q = mem_queue();
        add(&mut q, b"x");
        add(&mut q, b"y");
        let now = SystemTime::now();
        let item = q.remove(true, false, now).unwrap().unwrap();
        assert_eq!(item.data, "x");
        assert!(item.xid != 0);
        assert_eq!(q.open_read_count(), 1);

        assert!(q.unremove(item.xid).unwrap());
        assert_eq!(q.open_read_count(), 0);
        // The aborted item returns to the head, ahead of "y".
        assert_eq!(q.remove(false, false, now).unwrap().unwrap().data, "x");
    }

    #[test]
    fn confirm_consumes_reservation() {
        let mut q = mem_queue();
        add(&mut q, b"x");
        let now = SystemTime::now();
        let item = q.remove(true, false, now).unwrap().unwrap();
        assert!(q.confirm(item.xid).unwrap());
        assert!(!q.confirm(item.xid).unwrap());
        assert!(q.remove(false, false, now).unwrap().is_none());
    }

    #[test]
    fn peek_does_not_consume() {
        let mut q = mem_queue();
        add(&mut q, b"keep");
        let now = SystemTime::now();
        assert_eq!(q.remove(false, true, now).unwrap().unwrap().data, "keep");
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn expired_head_is_discarded() {
        let mut q = mem_queue();
        let past = SystemTime::now() - Duration::from_secs(5);
        q.add(Bytes::from_static(b"stale"), Some(past), past).unwrap();
        add(&mut q, b"fresh");
        let got = q.remove(false, false, SystemTime::now()).unwrap().unwrap();
        assert_eq!(got.data, "fresh");
    }

    #[test]
    fn capacity_refusal() {
        let mut q = PersistentQueue::new(
            "small",
            QueueLimits {
                max_items: 1,
                max_item_size: 0,
            },
            None,
        );
        let now = SystemTime::now();
        assert!(q.add(Bytes::from_static(b"one"), None, now).unwrap().is_some());
        assert!(q.add(Bytes::from_static(b"two"), None, now).unwrap().is_none());
    }

    #[test]
    fn waiter_is_woken_by_add() {
        let mut q = mem_queue();
        let mut rx = q.wait(7, false, false);
        assert!(rx.try_recv().is_err());
        add(&mut q, b"wake");
        assert_eq!(rx.try_recv().unwrap().data, "wake");
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn opening_waiter_reserves() {
        let mut q = mem_queue();
        let mut rx = q.wait(1, true, false);
        add(&mut q, b"res");
        let item = rx.try_recv().unwrap();
        assert!(item.xid != 0);
        assert_eq!(q.open_read_count(), 1);
        assert!(q.unremove(item.xid).unwrap());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn dropped_waiter_does_not_eat_items() {
        let mut q = mem_queue();
        let rx = q.wait(1, true, false);
        drop(rx);
        add(&mut q, b"survives");
        assert_eq!(q.len(), 1);
        assert_eq!(q.open_read_count(), 0);
    }

    #[test]
    fn cancel_waiter_only_once() {
        let mut q = mem_queue();
        let _rx = q.wait(3, false, false);
        assert!(q.cancel_waiter(3));
        assert!(!q.cancel_waiter(3));
    }

    #[test]
    fn replay_rolls_back_orphaned_reservations() {
        let mut q = mem_queue();
        let ops = vec![
            JournalOp::Add {
                expiry_ms: 0,
                data: Bytes::from_static(b"a"),
            },
            JournalOp::Add {
                expiry_ms: 0,
                data: Bytes::from_static(b"b"),
            },
            JournalOp::Open { xid: 1 },
            JournalOp::Open { xid: 2 },
        ];
        q.replay(ops).unwrap();
        let now = SystemTime::now();
        // Both reservations belonged to a dead process; FIFO is restored.
        assert_eq!(q.open_read_count(), 0);
        assert_eq!(q.remove(false, false, now).unwrap().unwrap().data, "a");
        assert_eq!(q.remove(false, false, now).unwrap().unwrap().data, "b");
    }
}
