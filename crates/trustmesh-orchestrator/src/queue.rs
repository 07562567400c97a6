use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use trustmesh_types::TaskId;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    task_id: TaskId,
}

impl Ord for ReadyEntry {
    // Max-heap: higher priority first, then FIFO by sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueInner {
    ready: BinaryHeap<ReadyEntry>,
    /// Entries waiting out a retry backoff, keyed by release time.
    delayed: BTreeMap<(DateTime<Utc>, u64), ReadyEntry>,
    seq: u64,
}

impl QueueInner {
    fn promote(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            self.ready.push(entry.remove());
        }
    }
}

/// Tasks waiting for dispatch. Holds ids only; the task itself stays with
/// the orchestrator, which skips ids whose task is no longer queued.
#[derive(Default)]
pub struct ReadyQueue {
    inner: Mutex<QueueInner>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(
        &self,
        task_id: TaskId,
        priority: i32,
        not_before: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.seq += 1;
        let entry = ReadyEntry {
            priority,
            seq: inner.seq,
            task_id,
        };
        match not_before {
            Some(at) if at > now => {
                let key = (at, entry.seq);
                inner.delayed.insert(key, entry);
            }
            _ => inner.ready.push(entry),
        }
    }

    /// Next dispatchable task at `now`.
    pub async fn pop_ready(&self, now: DateTime<Utc>) -> Option<TaskId> {
        let mut inner = self.inner.lock().await;
        inner.promote(now);
        inner.ready.pop().map(|e| e.task_id)
    }

    /// Number of entries dispatchable at `now`.
    pub async fn ready_len(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().await;
        inner.promote(now);
        inner.ready.len()
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.ready.len() + inner.delayed.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// When the earliest delayed entry becomes ready.
    pub async fn next_release(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().await;
        inner.delayed.keys().next().map(|(at, _)| *at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = ReadyQueue::new();
        let now = Utc::now();
        let (low, high_a, high_b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        queue.push(low, 0, None, now).await;
        queue.push(high_a, 5, None, now).await;
        queue.push(high_b, 5, None, now).await;

        assert_eq!(queue.pop_ready(now).await, Some(high_a));
        assert_eq!(queue.pop_ready(now).await, Some(high_b));
        assert_eq!(queue.pop_ready(now).await, Some(low));
        assert_eq!(queue.pop_ready(now).await, None);
    }

    #[tokio::test]
    async fn test_delayed_entries_wait_for_release() {
        let queue = ReadyQueue::new();
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(5);
        let delayed = Uuid::new_v4();
        queue.push(delayed, 10, Some(later), now).await;

        assert_eq!(queue.pop_ready(now).await, None);
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.next_release().await, Some(later));
        assert_eq!(queue.pop_ready(later).await, Some(delayed));
        assert!(queue.is_empty().await);
    }

    proptest::proptest! {
        #[test]
        fn prop_pops_never_increase_in_priority(priorities in proptest::collection::vec(-5i32..5, 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let queue = ReadyQueue::new();
                let now = Utc::now();
                let mut ids = std::collections::HashMap::new();
                for p in &priorities {
                    let id = Uuid::new_v4();
                    ids.insert(id, *p);
                    queue.push(id, *p, None, now).await;
                }
                let mut last = i32::MAX;
                let mut popped = 0;
                while let Some(id) = queue.pop_ready(now).await {
                    let p = ids[&id];
                    proptest::prop_assert!(p <= last, "priority {} popped after {}", p, last);
                    last = p;
                    popped += 1;
                }
                proptest::prop_assert_eq!(popped, priorities.len());
                Ok(())
            })?;
        }
    }
}
