use crate::error::EngineError;
use chrono::Duration;
use detection::{
    Assignment, BotScorer, GraphBuilder, NarrativeAnalyzer, NarrativeClusterer, ReclusterReport,
};
use ingestion::embedding::{DeterministicEmbedder, Embedder};
use ingestion::urls::{HeuristicThreatIntel, ThreatIntel};
use ingestion::{IngestOutcome, IngestionPipeline, RawEvent};
use jobs::{BoundedQueue, ChannelJobQueue, Job, JobQueue, PushOutcome};
use query::{QueryService, SnapshotPublisher};
use sentinel_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink};
use sentinel_core::clock::{Clock, SystemClock};
use sentinel_core::config::AppConfig;
use sentinel_core::error::{ErrorKind, SentinelError};
use sentinel_core::model::{BotScore, NarrativeId, Post, PostId};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use storage::index::SimilarityIndex;
use storage::narratives::NarrativeStore;
use storage::repo::Repository;
use storage::snapshot::CheckpointStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestReport {
    Assigned {
        post_id: PostId,
        assignment: Assignment,
    },
    Duplicate {
        post_id: PostId,
    },
}

/// Tally of one synchronous pass over the inbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub assigned: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn record(&mut self, result: &Result<IngestReport, EngineError>) {
        match result {
            Ok(IngestReport::Assigned { .. }) => self.assigned += 1,
            Ok(IngestReport::Duplicate { .. }) => self.duplicates += 1,
            Err(e) if e.error_kind() == ErrorKind::MalformedEvent => self.malformed += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.assigned + self.duplicates + self.malformed + self.failed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub recovered: usize,
    pub failed: usize,
}

impl ReplayReport {
    pub fn total(&self) -> usize {
        self.recovered + self.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisReport {
    pub scored_accounts: usize,
    pub window_posts: usize,
    /// Version published by this pass; `None` when partitioning failed and
    /// the previous snapshot stayed in place.
    pub graph_version: Option<u64>,
    pub communities: usize,
    pub bursts: usize,
    pub narratives_refreshed: usize,
    pub archived: Vec<NarrativeId>,
}

pub struct EngineBuilder {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    embedder: Option<Arc<dyn Embedder>>,
    threat_intel: Arc<dyn ThreatIntel>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    dead_letter_sink: Option<Arc<dyn AuditSink>>,
    checkpoint_dir: Option<PathBuf>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            embedder: None,
            threat_intel: Arc::new(HeuristicThreatIntel::default()),
            audit_sink: None,
            dead_letter_sink: None,
            checkpoint_dir: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn threat_intel(mut self, threat_intel: Arc<dyn ThreatIntel>) -> Self {
        self.threat_intel = threat_intel;
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn dead_letter_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.dead_letter_sink = Some(sink);
        self
    }

    /// Enables resumable batch jobs.
    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        config.validate().map_err(EngineError::Config)?;

        let dims = config.ingestion.embedding_dims;
        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(DeterministicEmbedder::new(dims)));
        if embedder.dims() != dims {
            return Err(EngineError::Config(format!(
                "embedder produces {} dimensions, ingestion.embedding_dims is {}",
                embedder.dims(),
                dims
            )));
        }

        let repo = Arc::new(Repository::new());
        let index = Arc::new(SimilarityIndex::with_dimension(dims));
        let narratives = Arc::new(NarrativeStore::new());

        let mut pipeline = IngestionPipeline::with_components(
            Arc::clone(&repo),
            Arc::clone(&index),
            embedder,
            Arc::clone(&self.clock),
            &config,
        );
        let mut clusterer = NarrativeClusterer::new(
            Arc::clone(&narratives),
            Arc::clone(&index),
            &config.clustering,
        );
        if let Some(sink) = &self.audit_sink {
            pipeline.set_audit_sink(Arc::clone(sink));
            clusterer.set_audit_sink(Arc::clone(sink));
        }
        if let Some(sink) = &self.dead_letter_sink {
            pipeline.set_dead_letter_sink(Arc::clone(sink));
        }

        let publisher = Arc::new(SnapshotPublisher::empty(self.clock.now()));
        let query = QueryService::new(
            Arc::clone(&repo),
            Arc::clone(&narratives),
            Arc::clone(&publisher),
            Arc::clone(&self.clock),
            &config.query,
        );

        let (job_tx, job_rx) = mpsc::channel(config.jobs.worker_queue_capacity.max(1));

        Ok(Engine {
            scorer: BotScorer::new(&config.bot),
            graph_builder: GraphBuilder::new(&config.graph),
            analyzer: NarrativeAnalyzer::new(
                &config.risk,
                self.threat_intel,
                config.clustering.max_contention_retries,
            ),
            inbox: BoundedQueue::new(
                config.ingestion.queue_capacity,
                config.ingestion.overflow_policy,
            ),
            checkpoints: self.checkpoint_dir.map(CheckpointStore::new),
            clock: self.clock,
            audit_sink: self.audit_sink,
            repo,
            index,
            narratives,
            pipeline,
            clusterer,
            publisher,
            query,
            jobs: ChannelJobQueue::new(job_tx),
            job_rx: Mutex::new(Some(job_rx)),
            batch_gate: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            config,
        })
    }
}

/// Every stage wired together: ingestion inbox, incremental clustering,
/// account scoring, graph analysis and the read side.
pub struct Engine {
    pub(crate) config: AppConfig,
    pub(crate) clock: Arc<dyn Clock>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    repo: Arc<Repository>,
    index: Arc<SimilarityIndex>,
    narratives: Arc<NarrativeStore>,
    pipeline: IngestionPipeline,
    clusterer: NarrativeClusterer,
    scorer: BotScorer,
    graph_builder: GraphBuilder,
    analyzer: NarrativeAnalyzer,
    publisher: Arc<SnapshotPublisher>,
    query: QueryService,
    checkpoints: Option<CheckpointStore>,
    pub(crate) inbox: BoundedQueue<RawEvent>,
    jobs: ChannelJobQueue,
    job_rx: Mutex<Option<mpsc::Receiver<Job>>>,
    batch_gate: tokio::sync::Mutex<()>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) running: AtomicBool,
}

impl Engine {
    pub fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn from_config(config: AppConfig) -> Result<Self, EngineError> {
        EngineBuilder::new(config).build()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn query(&self) -> &QueryService {
        &self.query
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn narratives(&self) -> &Arc<NarrativeStore> {
        &self.narratives
    }

    pub fn index(&self) -> &Arc<SimilarityIndex> {
        &self.index
    }

    pub fn publisher(&self) -> &Arc<SnapshotPublisher> {
        &self.publisher
    }

    /// Events waiting in the inbox.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    /// Events refused or evicted by the inbox since startup.
    pub fn dropped(&self) -> u64 {
        self.inbox.dropped()
    }

    /// Queues a raw event. A full inbox either refuses it with `Overloaded`
    /// or evicts the oldest pending event, per the overflow policy.
    pub fn submit(&self, raw: RawEvent) -> Result<(), EngineError> {
        match self.inbox.push(raw) {
            Ok(PushOutcome::Accepted) => Ok(()),
            Ok(PushOutcome::DisplacedOldest(evicted)) => {
                warn!(platform = %evicted.platform, "inbox full, oldest event dropped");
                self.audit(
                    AuditEvent::new(AuditOperation::Ingest, AuditOutcome::Dropped)
                        .kind(ErrorKind::Overloaded)
                        .with("platform", evicted.platform)
                        .with("reason", "evicted by newer event"),
                );
                Ok(())
            }
            Err(e) => {
                warn!(capacity = self.inbox.capacity(), "event refused: {}", e);
                self.audit(
                    AuditEvent::new(AuditOperation::Ingest, AuditOutcome::Dropped)
                        .kind(e.error_kind())
                        .with("reason", e.to_string()),
                );
                Err(e.into())
            }
        }
    }

    /// Ingests and assigns one event on the caller's task. A redelivered id
    /// whose earlier delivery stopped short of a narrative is finished here.
    pub async fn ingest_now(&self, raw: RawEvent) -> Result<IngestReport, EngineError> {
        let post = match self.pipeline.ingest(raw).await? {
            IngestOutcome::Ingested(post) | IngestOutcome::Resumed(post) => post,
            IngestOutcome::Duplicate { post_id } => match self.repo.get_post(&post_id) {
                Some(stored)
                    if stored.embedding.is_some()
                        && self.narratives.narrative_of(&post_id).is_none() =>
                {
                    stored
                }
                _ => return Ok(IngestReport::Duplicate { post_id }),
            },
        };
        self.place(post).await
    }

    /// Embeds and assigns every stored post whose embedding failed earlier,
    /// oldest first. These are the posts the dead-letter sink recorded.
    pub async fn replay_dead_letters(&self) -> ReplayReport {
        let mut report = ReplayReport::default();
        for mut post in self.repo.unembedded_posts() {
            let result = match self.pipeline.embed_post(&post).await {
                Ok(embedding) => {
                    post.embedding = Some(embedding);
                    self.place(post).await
                }
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(_) => report.recovered += 1,
                Err(e) => {
                    debug!(kind = e.error_kind().as_str(), "replay attempt failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        if report.total() > 0 {
            info!(
                recovered = report.recovered,
                failed = report.failed,
                "dead letters replayed"
            );
        }
        report
    }

    async fn place(&self, post: Post) -> Result<IngestReport, EngineError> {
        let assignment = match self.clusterer.assign(&post) {
            Ok(assignment) => assignment,
            Err(e) => {
                error!(post_id = %post.id, "narrative assignment failed: {}", e);
                return Err(e.into());
            }
        };
        debug!(
            post_id = %post.id,
            narrative_id = %assignment.narrative_id(),
            "post assigned"
        );

        // Scoring jobs are only queued while a worker drains them.
        if self.running.load(Ordering::SeqCst) {
            let job = Job::ScoreAccount {
                account_id: post.author_id.clone(),
            };
            if let Err(e) = self.jobs.enqueue(job).await {
                warn!(account_id = %post.author_id, "failed to enqueue scoring job: {}", e);
            }
        }

        Ok(IngestReport::Assigned {
            post_id: post.id,
            assignment,
        })
    }

    /// Processes everything currently in the inbox on the caller's task.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        while let Some(raw) = self.inbox.try_pop() {
            let result = self.ingest_now(raw).await;
            report.record(&result);
        }
        if report.total() > 0 {
            info!(
                assigned = report.assigned,
                duplicates = report.duplicates,
                malformed = report.malformed,
                failed = report.failed,
                "inbox drained"
            );
        }
        report
    }

    pub fn score_account(&self, account_id: &str) -> Option<BotScore> {
        let account = self.repo.get_account(account_id)?;
        let recent = self
            .repo
            .recent_posts_by(account_id, self.config.bot.recent_post_limit);
        let score = self
            .scorer
            .score_account(&account, &recent, self.clock.now());
        debug!(account_id, score = score.score, label = score.label.as_str(), "account scored");
        self.repo.put_bot_score(score.clone());
        Some(score)
    }

    /// Rescores every known account. Returns how many were scored.
    pub fn score_accounts(&self) -> usize {
        let now = self.clock.now();
        let limit = self.config.bot.recent_post_limit;
        let accounts = self.repo.accounts();
        for account in &accounts {
            let recent = self.repo.recent_posts_by(&account.id, limit);
            self.repo
                .put_bot_score(self.scorer.score_account(account, &recent, now));
        }
        accounts.len()
    }

    /// Scores accounts, rebuilds and partitions the interaction graph over
    /// the graph window, publishes it, then reassesses narrative risk and
    /// archives dead narratives. A failed partition keeps the previous graph
    /// published; risk is still refreshed against it.
    pub async fn run_analysis_pass(&self) -> Result<AnalysisReport, EngineError> {
        let _gate = self.batch_gate.lock().await;
        let now = self.clock.now();
        let mut report = AnalysisReport {
            scored_accounts: self.score_accounts(),
            ..Default::default()
        };

        let posts = self
            .repo
            .posts_between(now - Duration::hours(self.config.graph.window_hours), now);
        report.window_posts = posts.len();
        let build = self.graph_builder.build(&posts, &self.repo);
        report.bursts = build.bursts.len();

        match self
            .graph_builder
            .partition_resumable(&build.graph, self.checkpoints.as_ref(), &self.shutdown)
            .await
        {
            Ok(partition) => {
                let snapshot = self.graph_builder.snapshot(build, &partition, &self.repo, now);
                report.communities = snapshot.communities.len();
                report.graph_version = Some(self.publisher.publish(snapshot));
                self.audit(
                    AuditEvent::new(AuditOperation::Partition, AuditOutcome::Succeeded)
                        .with("communities", report.communities.to_string()),
                );
            }
            Err(e) => {
                error!(
                    version = self.publisher.version(),
                    "partition failed, keeping previous graph: {}", e
                );
                self.audit(
                    AuditEvent::new(AuditOperation::Partition, AuditOutcome::Failed)
                        .kind(e.error_kind())
                        .with("reason", e.to_string()),
                );
            }
        }

        let graph = self.publisher.load();
        report.narratives_refreshed = self
            .analyzer
            .refresh(&self.narratives, &self.repo, &graph, now)?;
        report.archived = self.clusterer.archive_stale(now)?;

        info!(
            scored = report.scored_accounts,
            posts = report.window_posts,
            communities = report.communities,
            refreshed = report.narratives_refreshed,
            archived = report.archived.len(),
            "analysis pass complete"
        );
        Ok(report)
    }

    /// Density recluster over the clustering window.
    pub async fn recluster(&self) -> Result<ReclusterReport, EngineError> {
        let _gate = self.batch_gate.lock().await;
        let now = self.clock.now();
        let posts = self.repo.posts_between(
            now - Duration::hours(self.config.clustering.window_hours),
            now,
        );
        let report = self
            .clusterer
            .recluster(&posts, self.checkpoints.as_ref(), &self.shutdown)
            .await?;
        Ok(report)
    }

    pub(crate) fn take_job_receiver(&self) -> Option<mpsc::Receiver<Job>> {
        self.job_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn audit(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit_sink {
            if let Err(e) = sink.record(event) {
                warn!("failed to record audit event: {}", e);
            }
        }
    }
}
