use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::db::models::{Priority, QueueLane};

/// A queue handle. Ephemeral — the record store (crate::db) owns truth about
/// the notification itself; this is only enough to route and reschedule it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub notification_id: String,
    pub priority: Priority,
    pub retry_count: i64,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(notification_id: String, priority: Priority, retry_count: i64) -> Self {
        Self {
            notification_id,
            priority,
            retry_count,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub item: QueueItem,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize)]
pub struct QueueDepth {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub scheduled: usize,
    pub retry: usize,
    pub dlq: usize,
}

struct Lanes {
    high: VecDeque<QueueItem>,
    normal: VecDeque<QueueItem>,
    low: VecDeque<QueueItem>,
}

impl Lanes {
    fn lane_mut(&mut self, lane: QueueLane) -> &mut VecDeque<QueueItem> {
        match lane {
            QueueLane::High => &mut self.high,
            QueueLane::Normal => &mut self.normal,
            QueueLane::Low => &mut self.low,
        }
    }

    /// Strict priority pop: high, then normal, then low.
    fn pop_front_any(&mut self) -> Option<QueueItem> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }
}

/// In-process priority queue with delayed/scheduled sub-queues, retry
/// backoff, and a dead-letter list. Not backed by an external broker —
/// lane and retry state live entirely in memory, the record store in
/// SQLite remains the durable source of truth.
pub struct QueueStore {
    lanes: Mutex<Lanes>,
    scheduled: Mutex<BTreeMap<(i64, u64), QueueItem>>,
    retry: Mutex<BTreeMap<(i64, u64), QueueItem>>,
    dlq: Mutex<Vec<DlqEntry>>,
    notify: Notify,
    tie_break: AtomicU64,
}

impl QueueStore {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                high: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
            }),
            scheduled: Mutex::new(BTreeMap::new()),
            retry: Mutex::new(BTreeMap::new()),
            dlq: Mutex::new(Vec::new()),
            notify: Notify::new(),
            tie_break: AtomicU64::new(0),
        }
    }

    fn next_tie_break(&self) -> u64 {
        self.tie_break.fetch_add(1, Ordering::Relaxed)
    }

    /// Append to the tail of the priority lane determined by `item.priority`.
    pub fn enqueue(&self, item: QueueItem) {
        let lane = item.priority.lane();
        self.lanes.lock().unwrap().lane_mut(lane).push_back(item);
        self.notify.notify_one();
    }

    /// Insert at the head of the priority lane. Used by presence instant-flush.
    pub fn enqueue_head(&self, item: QueueItem) {
        let lane = item.priority.lane();
        self.lanes.lock().unwrap().lane_mut(lane).push_front(item);
        self.notify.notify_one();
    }

    /// Block up to `wait` for an item, draining strictly by priority
    /// (high before normal before low) regardless of which lane woke us.
    pub async fn dequeue(&self, wait: Duration) -> Option<QueueItem> {
        if let Some(item) = self.lanes.lock().unwrap().pop_front_any() {
            return Some(item);
        }

        let notified = self.notify.notified();
        if timeout(wait, notified).await.is_err() {
            return None;
        }

        self.lanes.lock().unwrap().pop_front_any()
    }

    pub fn enqueue_scheduled(&self, item: QueueItem, at: DateTime<Utc>) {
        let key = (at.timestamp(), self.next_tie_break());
        self.scheduled.lock().unwrap().insert(key, item);
    }

    pub fn enqueue_retry(&self, item: QueueItem, at: DateTime<Utc>) {
        let key = (at.timestamp(), self.next_tie_break());
        self.retry.lock().unwrap().insert(key, item);
    }

    /// Atomically remove and return all items in `set` with score <= now,
    /// up to `limit`.
    fn drain_ready_from(
        set: &Mutex<BTreeMap<(i64, u64), QueueItem>>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<QueueItem> {
        let mut guard = set.lock().unwrap();
        let ready_keys: Vec<(i64, u64)> = guard
            .range(..=(now.timestamp(), u64::MAX))
            .take(limit)
            .map(|(k, _)| *k)
            .collect();

        ready_keys
            .into_iter()
            .filter_map(|k| guard.remove(&k))
            .collect()
    }

    pub fn drain_ready_scheduled(&self, limit: usize, now: DateTime<Utc>) -> Vec<QueueItem> {
        Self::drain_ready_from(&self.scheduled, limit, now)
    }

    pub fn drain_ready_retry(&self, limit: usize, now: DateTime<Utc>) -> Vec<QueueItem> {
        Self::drain_ready_from(&self.retry, limit, now)
    }

    pub fn enqueue_dlq(&self, item: QueueItem, reason: String) {
        self.dlq.lock().unwrap().push(DlqEntry {
            item,
            reason,
            timestamp: Utc::now(),
        });
    }

    pub fn list_dlq(&self, limit: usize) -> Vec<DlqEntry> {
        self.dlq.lock().unwrap().iter().take(limit).cloned().collect()
    }

    /// Removes up to `limit` DLQ entries and returns them for replay.
    /// Does not re-enqueue: the caller must first flip each notification's
    /// durable status back to `queued` (dequeue drops anything still
    /// `failed`), then call `enqueue` itself.
    pub fn drain_dlq(&self, limit: usize) -> Vec<DlqEntry> {
        let mut dlq = self.dlq.lock().unwrap();
        let take = limit.min(dlq.len());
        dlq.drain(0..take).collect()
    }

    pub fn depth(&self) -> QueueDepth {
        let lanes = self.lanes.lock().unwrap();
        QueueDepth {
            high: lanes.high.len(),
            normal: lanes.normal.len(),
            low: lanes.low.len(),
            scheduled: self.scheduled.lock().unwrap().len(),
            retry: self.retry.lock().unwrap().len(),
            dlq: self.dlq.lock().unwrap().len(),
        }
    }
}

impl Default for QueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, priority: Priority) -> QueueItem {
        QueueItem::new(id.to_string(), priority, 0)
    }

    #[tokio::test]
    async fn strict_priority_dequeue() {
        let q = QueueStore::new();
        q.enqueue(item("low-1", Priority::Low));
        q.enqueue(item("normal-1", Priority::Normal));
        q.enqueue(item("high-1", Priority::High));

        let first = q.dequeue(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.notification_id, "high-1");
        let second = q.dequeue(Duration::from_millis(50)).await.unwrap();
        assert_eq!(second.notification_id, "normal-1");
        let third = q.dequeue(Duration::from_millis(50)).await.unwrap();
        assert_eq!(third.notification_id, "low-1");
    }

    #[tokio::test]
    async fn critical_absorbs_into_high_lane() {
        let q = QueueStore::new();
        q.enqueue(item("crit-1", Priority::Critical));
        let depth = q.depth();
        assert_eq!(depth.high, 1);
        assert_eq!(depth.normal, 0);
    }

    #[tokio::test]
    async fn fifo_within_lane() {
        let q = QueueStore::new();
        q.enqueue(item("a", Priority::Normal));
        q.enqueue(item("b", Priority::Normal));
        let first = q.dequeue(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.notification_id, "a");
    }

    #[tokio::test]
    async fn head_enqueue_jumps_the_line() {
        let q = QueueStore::new();
        q.enqueue(item("a", Priority::Normal));
        q.enqueue_head(item("flush", Priority::Normal));
        let first = q.dequeue(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.notification_id, "flush");
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let q = QueueStore::new();
        let got = q.dequeue(Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[test]
    fn drain_ready_respects_score_and_limit() {
        let q = QueueStore::new();
        let now = Utc::now();
        q.enqueue_scheduled(item("past", Priority::Normal), now - chrono::Duration::seconds(5));
        q.enqueue_scheduled(item("future", Priority::Normal), now + chrono::Duration::seconds(60));

        let drained = q.drain_ready_scheduled(10, now);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].notification_id, "past");
        assert_eq!(q.depth().scheduled, 1);
    }

    #[test]
    fn dlq_drain_preserves_retry_count_and_removes_entries() {
        let q = QueueStore::new();
        let mut i = item("x", Priority::High);
        i.retry_count = 3;
        q.enqueue_dlq(i, "exhausted".to_string());

        let drained = q.drain_dlq(10);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].item.retry_count, 3);
        assert_eq!(q.depth().dlq, 0);

        q.enqueue(drained.into_iter().next().unwrap().item);
        assert_eq!(q.depth().high, 1);
    }
}
