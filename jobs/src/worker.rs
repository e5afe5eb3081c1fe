use crate::queue::{Job, JobError};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> anyhow::Result<()>;
}

pub struct Worker {
    receiver: mpsc::Receiver<Job>,
    handler: Arc<dyn JobHandler>,
    token: CancellationToken,
}

impl Worker {
    pub fn new(
        receiver: mpsc::Receiver<Job>,
        handler: Arc<dyn JobHandler>,
        token: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            handler,
            token,
        }
    }

    pub async fn run(mut self) {
        info!("Worker started");
        loop {
            let job = tokio::select! {
                _ = self.token.cancelled() => break,
                job = self.receiver.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            if let Err(e) = self.handler.handle(job.clone()).await {
                error!(?job, "job failed: {}", e);
            }
        }
        info!("Worker stopped");
    }
}

/// Per-item work executed by a partition worker.
#[async_trait::async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, item: T);
}

/// Stable partition for `key`; the same key always lands on the same worker.
pub fn partition_of(key: &str, partitions: usize) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(prefix) % partitions.max(1) as u64) as usize
}

/// Fixed set of workers, each draining its own channel. Items sharing a key
/// are processed sequentially in dispatch order.
pub struct PartitionedPool<T> {
    senders: Vec<mpsc::Sender<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> PartitionedPool<T> {
    pub fn spawn(
        workers: usize,
        capacity: usize,
        handler: Arc<dyn Handler<T>>,
        token: CancellationToken,
    ) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker in 0..workers {
            let (tx, mut rx) = mpsc::channel::<T>(capacity.max(1));
            let handler = Arc::clone(&handler);
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                info!(worker, "partition worker started");
                loop {
                    let item = tokio::select! {
                        _ = token.cancelled() => break,
                        item = rx.recv() => match item {
                            Some(item) => item,
                            None => break,
                        },
                    };
                    handler.handle(item).await;
                }
                info!(worker, "partition worker stopped");
            }));
            senders.push(tx);
        }

        Self { senders, handles }
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    pub async fn dispatch(&self, key: &str, item: T) -> Result<(), JobError> {
        let sender = &self.senders[partition_of(key, self.senders.len())];
        sender.send(item).await.map_err(|_| JobError::Closed)
    }

    /// Closes every channel and waits for workers to drain what they hold.
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("partition worker panicked: {}", e);
            }
        }
    }
}
