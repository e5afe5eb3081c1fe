use crate::engine::Engine;
use crate::error::EngineError;
use async_trait::async_trait;
use ingestion::{routing_key, RawEvent};
use jobs::scheduler::spawn_periodic;
use jobs::{Handler, Job, JobHandler, PartitionedPool, Worker};
use sentinel_core::error::SentinelError;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

struct IngestHandler {
    engine: Arc<Engine>,
}

#[async_trait]
impl Handler<RawEvent> for IngestHandler {
    async fn handle(&self, raw: RawEvent) {
        if let Err(e) = self.engine.ingest_now(raw).await {
            debug!(kind = e.error_kind().as_str(), "event not ingested: {}", e);
        }
    }
}

struct EngineJobs {
    engine: Arc<Engine>,
}

#[async_trait]
impl JobHandler for EngineJobs {
    async fn handle(&self, job: Job) -> anyhow::Result<()> {
        match job {
            Job::ScoreAccount { account_id } => {
                if self.engine.score_account(&account_id).is_none() {
                    anyhow::bail!("unknown account {account_id}");
                }
            }
            Job::RunAnalysis => {
                self.engine.run_analysis_pass().await?;
            }
            Job::Recluster => {
                self.engine.recluster().await?;
            }
        }
        Ok(())
    }
}

/// Background tasks of a started engine.
pub struct EngineHandle {
    engine: Arc<Engine>,
    dispatcher: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Spawns the per-author ingest workers, the job worker and the periodic
    /// analysis and recluster jobs. An engine starts at most once.
    pub fn start(self: Arc<Self>) -> Result<EngineHandle, EngineError> {
        let receiver = self.take_job_receiver().ok_or(EngineError::AlreadyStarted)?;
        self.running.store(true, Ordering::SeqCst);

        let settings = self.config.jobs.clone();
        let background = self.shutdown.child_token();

        let pool = PartitionedPool::<RawEvent>::spawn(
            settings.workers,
            settings.worker_queue_capacity,
            Arc::new(IngestHandler {
                engine: Arc::clone(&self),
            }),
            background.clone(),
        );
        info!(workers = pool.workers(), "ingest workers started");

        let dispatcher = {
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(raw) = engine.inbox.pop().await {
                    let key = routing_key(&raw).unwrap_or_else(|| raw.platform.clone());
                    if let Err(e) = pool.dispatch(&key, raw).await {
                        error!("ingest workers unavailable: {}", e);
                        break;
                    }
                }
                pool.shutdown().await;
                debug!("ingest dispatcher stopped");
            })
        };

        let mut tasks = Vec::with_capacity(3);
        let handler = Arc::new(EngineJobs {
            engine: Arc::clone(&self),
        });
        tasks.push(tokio::spawn(
            Worker::new(receiver, handler, background.clone()).run(),
        ));

        let engine = Arc::clone(&self);
        tasks.push(spawn_periodic(
            "analysis",
            Duration::from_secs(settings.analysis_interval_secs),
            background.clone(),
            move || {
                let engine = Arc::clone(&engine);
                async move {
                    engine.replay_dead_letters().await;
                    if let Err(e) = engine.run_analysis_pass().await {
                        error!(kind = e.error_kind().as_str(), "analysis pass failed: {}", e);
                    }
                }
            },
        ));

        let engine = Arc::clone(&self);
        tasks.push(spawn_periodic(
            "recluster",
            Duration::from_secs(settings.recluster_interval_secs),
            background,
            move || {
                let engine = Arc::clone(&engine);
                async move {
                    match engine.recluster().await {
                        Ok(report) => debug!(
                            clusters = report.clusters,
                            moved = report.moved,
                            "scheduled recluster finished"
                        ),
                        Err(e) => error!(kind = e.error_kind().as_str(), "recluster failed: {}", e),
                    }
                }
            },
        ));

        Ok(EngineHandle {
            engine: self,
            dispatcher,
            tasks,
        })
    }
}

impl EngineHandle {
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Stops accepting events, waits for queued ones to be ingested, then
    /// cancels the job worker and periodic jobs. A batch pass in flight is
    /// cancelled and leaves its checkpoint behind.
    pub async fn shutdown(self) {
        self.engine.inbox.close();
        if let Err(e) = self.dispatcher.await {
            error!("ingest dispatcher panicked: {}", e);
        }
        self.engine.running.store(false, Ordering::SeqCst);
        self.engine.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("engine task panicked: {}", e);
            }
        }
        info!("engine stopped");
    }
}
