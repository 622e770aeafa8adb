//! Per-session bookkeeping of reliable-read reservations: queue name to the
//! insertion-ordered xids this session holds open.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use spool_store::QueueCollection;

#[derive(Debug, Default)]
pub struct PendingReadSet {
    inner: Mutex<HashMap<String, VecDeque<u32>>>,
}

impl PendingReadSet {
    pub fn new() -> Self {
        PendingReadSet::default()
    }

    pub fn add(&self, queue: &str, xid: u32) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.entry(queue.to_string()).or_default().push_back(xid);
    }

    /// Removes and returns the oldest xid for the queue.
    pub fn pop(&self, queue: &str) -> Option<u32> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let seq = inner.get_mut(queue)?;
        let xid = seq.pop_front();
        if seq.is_empty() {
            inner.remove(queue);
        }
        xid
    }

    /// Removes and returns up to the oldest `n` xids; may return fewer.
    pub fn pop_n(&self, queue: &str, n: usize) -> Vec<u32> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let Some(seq) = inner.get_mut(queue) else {
            return Vec::new();
        };
        let take = n.min(seq.len());
        let popped = seq.drain(..take).collect();
        if seq.is_empty() {
            inner.remove(queue);
        }
        popped
    }

    pub fn pop_all(&self, queue: &str) -> Vec<u32> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .remove(queue)
            .map(|seq| seq.into_iter().collect())
            .unwrap_or_default()
    }

    /// Non-destructive snapshot of one queue's pending xids, oldest first.
    pub fn peek(&self, queue: &str) -> Vec<u32> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .get(queue)
            .map(|seq| seq.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn size(&self, queue: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.get(queue).map(VecDeque::len).unwrap_or(0)
    }

    /// Total pending across all queues; the bound checked against
    /// `max_open_reads`.
    pub fn total(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.values().map(VecDeque::len).sum()
    }

    /// Removes any of `ids` that are present; returns those actually removed.
    pub fn remove(&self, queue: &str, ids: &HashSet<u32>) -> HashSet<u32> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let Some(seq) = inner.get_mut(queue) else {
            return HashSet::new();
        };
        let mut removed = HashSet::new();
        seq.retain(|xid| {
            if ids.contains(xid) {
                removed.insert(*xid);
                false
            } else {
                true
            }
        });
        if seq.is_empty() {
            inner.remove(queue);
        }
        removed
    }

    /// Snapshots and clears the whole map under the lock, then releases every
    /// reservation outside it. Returns the number of xids cancelled.
    pub fn cancel_all(&self, queues: &QueueCollection) -> usize {
        let drained: HashMap<String, VecDeque<u32>> = {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut inner)
        };
        let mut cancelled = 0;
        for (queue, xids) in drained {
            for xid in xids {
                match queues.unremove(&queue, xid) {
                    Ok(_) => cancelled += 1,
                    Err(err) => {
                        tracing::warn!(queue = %queue, xid, error = %err, "rollback of open read failed");
                    }
                }
            }
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use spool_store::{CollectionConfig, RemoveOutcome};
    use std::time::SystemTime;

    #[test]
    fn pop_preserves_insertion_order() {
        let set = PendingReadSet::new();
        set.add("q", 3);
        set.add("q", 1);
        set.add("q", 2);
        assert_eq!(set.pop("q"), Some(3));
        assert_eq!(set.pop_n("q", 5), vec![1, 2]);
        assert_eq!(set.pop("q"), None);
        assert_eq!(set.total(), 0);
    }

    #[test]
    fn peek_is_non_destructive() {
        let set = PendingReadSet::new();
        set.add("q", 10);
        set.add("q", 11);
        assert_eq!(set.peek("q"), vec![10, 11]);
        assert_eq!(set.size("q"), 2);
    }

    #[test]
    fn totals_span_queues() {
        let set = PendingReadSet::new();
        set.add("a", 1);
        set.add("b", 2);
        set.add("b", 3);
        assert_eq!(set.total(), 3);
        assert_eq!(set.pop_all("b"), vec![2, 3]);
        assert_eq!(set.total(), 1);
    }

    #[test]
    fn remove_reports_what_was_present() {
        let set = PendingReadSet::new();
        set.add("q", 1);
        set.add("q", 2);
        set.add("q", 3);
        let removed = set.remove("q", &HashSet::from([2, 9]));
        assert_eq!(removed, HashSet::from([2]));
        assert_eq!(set.peek("q"), vec![1, 3]);
    }

    #[tokio::test]
    async fn cancel_all_releases_reservations() {
        let queues = QueueCollection::open(CollectionConfig::default()).unwrap();
        for data in [&b"a"[..], b"b"] {
            queues
                .add("q", Bytes::copy_from_slice(data), None, SystemTime::now(), "test")
                .await
                .unwrap();
        }
        let set = PendingReadSet::new();
        for _ in 0..2 {
            let RemoveOutcome::Ready(Some(item)) =
                queues.remove("q", false, true, false, "test").unwrap()
            else {
                panic!("expected item");
            };
            set.add("q", item.xid);
        }
        assert_eq!(set.total(), 2);

        assert_eq!(set.cancel_all(&queues), 2);
        assert_eq!(set.total(), 0);
        // Both items are back, in original order.
        let RemoveOutcome::Ready(Some(first)) =
            queues.remove("q", false, false, false, "test").unwrap()
        else {
            panic!("expected item");
        };
        assert_eq!(first.data, "a");
    }
}
