use sentinel_core::config::OverflowPolicy;
use sentinel_core::error::{ErrorKind, SentinelError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Job {
    ScoreAccount { account_id: String },
    RunAnalysis,
    Recluster,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("queue is closed")]
    Closed,
}

impl SentinelError for JobError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            JobError::QueueFull { .. } => ErrorKind::Overloaded,
            JobError::Closed => ErrorKind::Internal,
        }
    }
}

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()>;
}

/// Simple in-memory queue using Tokio channels
pub struct ChannelJobQueue {
    sender: mpsc::Sender<Job>,
}

impl ChannelJobQueue {
    pub fn new(sender: mpsc::Sender<Job>) -> Self {
        Self { sender }
    }
}

#[async_trait::async_trait]
impl JobQueue for ChannelJobQueue {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|e| anyhow::anyhow!("Queue send error: {}", e))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    Accepted,
    /// The queue was full; the oldest item was evicted to make room.
    DisplacedOldest(T),
}

/// FIFO with a hard capacity. When full, `Reject` refuses the new item and
/// `DropOldest` evicts the head.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            policy,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, item: T) -> Result<PushOutcome<T>, JobError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JobError::Closed);
        }

        let outcome = {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            if items.len() < self.capacity {
                items.push_back(item);
                PushOutcome::Accepted
            } else {
                match self.policy {
                    OverflowPolicy::Reject => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return Err(JobError::QueueFull {
                            capacity: self.capacity,
                        });
                    }
                    OverflowPolicy::DropOldest => {
                        let evicted = items.pop_front();
                        items.push_back(item);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        match evicted {
                            Some(evicted) => PushOutcome::DisplacedOldest(evicted),
                            None => PushOutcome::Accepted,
                        }
                    }
                }
            }
        };

        self.notify.notify_one();
        Ok(outcome)
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Waits for the next item. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items refused or evicted because of overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reject_policy_refuses_when_full() {
        let queue = BoundedQueue::new(2, OverflowPolicy::Reject);
        assert_eq!(queue.push(1).unwrap(), PushOutcome::Accepted);
        assert_eq!(queue.push(2).unwrap(), PushOutcome::Accepted);
        let err = queue.push(3).unwrap_err();
        assert_eq!(err, JobError::QueueFull { capacity: 2 });
        assert_eq!(err.error_kind(), ErrorKind::Overloaded);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn drop_oldest_policy_evicts_head() {
        let queue = BoundedQueue::new(2, OverflowPolicy::DropOldest);
        queue.push("a").unwrap();
        queue.push("b").unwrap();
        assert_eq!(queue.push("c").unwrap(), PushOutcome::DisplacedOldest("a"));
        assert_eq!(queue.try_pop(), Some("b"));
        assert_eq!(queue.try_pop(), Some("c"));
    }

    #[tokio::test]
    async fn pop_waits_for_push_and_ends_after_close() {
        let queue = Arc::new(BoundedQueue::new(4, OverflowPolicy::Reject));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = queue.pop().await {
                    seen.push(item);
                }
                seen
            })
        };

        queue.push(1).unwrap();
        queue.push(2).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.close();

        assert_eq!(consumer.await.unwrap(), vec![1, 2]);
        assert_eq!(queue.push(3), Err(JobError::Closed));
    }
}
