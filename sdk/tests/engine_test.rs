use chrono::{DateTime, Duration, TimeZone, Utc};
use ingestion::embedding::{BoxFuture, DeterministicEmbedder, Embedder, EmbeddingError};
use ingestion::RawEvent;
use query::{GraphParams, NarrativeParams, StatsParams};
use sentinel_core::audit::{AuditOperation, AuditOutcome, InMemoryAuditSink};
use sentinel_core::clock::ManualClock;
use sentinel_core::config::{AppConfig, OverflowPolicy};
use sentinel_core::error::{ErrorKind, SentinelError};
use sentinel_sdk::{Engine, EngineError, IngestReport};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn event(id: &str, author: &str, text: &str, minutes_ago: i64) -> RawEvent {
    RawEvent::new(
        "twitter",
        json!({
            "id": id,
            "author_id": author,
            "handle": format!("h_{author}"),
            "text": text,
            "created_at": (now() - Duration::minutes(minutes_ago)).to_rfc3339(),
            "followers": 50,
            "following": 60
        }),
    )
}

fn engine_with(config: AppConfig) -> (Engine, Arc<InMemoryAuditSink>) {
    let audit = Arc::new(InMemoryAuditSink::default());
    let engine = Engine::builder(config)
        .clock(Arc::new(ManualClock::new(now())))
        .audit_sink(audit.clone())
        .build()
        .unwrap();
    (engine, audit)
}

#[tokio::test]
async fn test_full_inbox_rejects_and_audits() {
    let mut config = AppConfig::default();
    config.ingestion.queue_capacity = 2;
    let (engine, audit) = engine_with(config);

    engine.submit(event("p1", "a", "first post", 5)).unwrap();
    engine.submit(event("p2", "a", "second post", 4)).unwrap();
    let err = engine.submit(event("p3", "a", "third post", 3)).unwrap_err();

    assert_eq!(err.error_kind(), ErrorKind::Overloaded);
    assert!(err.is_transient());
    assert_eq!(engine.pending(), 2);
    assert_eq!(engine.dropped(), 1);
    assert_eq!(audit.count(AuditOperation::Ingest, AuditOutcome::Dropped), 1);
}

#[tokio::test]
async fn test_drop_oldest_keeps_newest_events() {
    let mut config = AppConfig::default();
    config.ingestion.queue_capacity = 2;
    config.ingestion.overflow_policy = OverflowPolicy::DropOldest;
    let (engine, audit) = engine_with(config);

    for (id, minutes) in [("p1", 5), ("p2", 4), ("p3", 3)] {
        engine
            .submit(event(id, "a", "Bank XYZ liquidity crisis update", minutes))
            .unwrap();
    }
    assert_eq!(engine.pending(), 2);
    assert_eq!(audit.count(AuditOperation::Ingest, AuditOutcome::Dropped), 1);

    let report = engine.drain().await;
    assert_eq!(report.assigned, 2);
    assert!(engine.repository().get_post("p1").is_none());
    assert!(engine.repository().get_post("p3").is_some());
}

#[tokio::test]
async fn test_drain_tallies_duplicates_and_malformed_events() {
    let (engine, audit) = engine_with(AppConfig::default());

    engine.submit(event("p1", "a", "Bank XYZ liquidity crisis", 5)).unwrap();
    engine.submit(event("p1", "a", "Bank XYZ liquidity crisis", 5)).unwrap();
    engine
        .submit(RawEvent::new("twitter", json!({ "id": "p2", "text": "no author" })))
        .unwrap();

    let report = engine.drain().await;
    assert_eq!(report.assigned, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.malformed, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(engine.pending(), 0);
    assert_eq!(engine.repository().post_count(), 1);
    assert_eq!(engine.narratives().assignment_count(), 1);
    assert_eq!(audit.count(AuditOperation::Ingest, AuditOutcome::Dropped), 1);
}

#[tokio::test]
async fn test_duplicate_ingest_does_not_change_narratives() {
    let (engine, _) = engine_with(AppConfig::default());

    let first = engine
        .ingest_now(event("p1", "a", "Bank XYZ liquidity crisis", 5))
        .await
        .unwrap();
    let IngestReport::Assigned { assignment, .. } = first else {
        panic!("expected an assignment");
    };
    let narrative_id = assignment.narrative_id().to_string();
    let version = engine.narratives().version(&narrative_id);

    let second = engine
        .ingest_now(event("p1", "a", "Bank XYZ liquidity crisis", 5))
        .await
        .unwrap();
    assert_eq!(second, IngestReport::Duplicate { post_id: "p1".into() });
    assert_eq!(engine.narratives().version(&narrative_id), version);
    assert_eq!(engine.narratives().len(), 1);
}

#[tokio::test]
async fn test_empty_engine_serves_empty_projections() {
    let (engine, _) = engine_with(AppConfig::default());
    let query = engine.query();

    assert!(query.narratives(&NarrativeParams::default()).unwrap().data.is_empty());
    assert!(query.bots(&Default::default()).unwrap().data.is_empty());

    let graph = query.graph(&GraphParams::default()).unwrap();
    assert_eq!(graph.version, 0);
    assert!(graph.nodes.is_empty());
    assert!(graph.links.is_empty());

    let stats = query.stats(&StatsParams::default()).unwrap();
    assert_eq!(stats.timeline_data.len(), 49);
    assert!(stats.timeline_data.iter().all(|point| point.volume == 0));
    assert_eq!(stats.kpi.tweets, 0);

    let err = query.user("@nobody").unwrap_err();
    assert_eq!(err.error_kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_analysis_pass_publishes_new_graph_versions() {
    let dir = tempdir().unwrap();
    let audit = Arc::new(InMemoryAuditSink::default());
    let engine = Engine::builder(AppConfig::default())
        .clock(Arc::new(ManualClock::new(now())))
        .audit_sink(audit.clone())
        .checkpoint_dir(dir.path())
        .build()
        .unwrap();

    let posts = [
        ("p1", "a", "Bank XYZ is out of cash, withdraw now https://bit.ly/run1", 30),
        ("p2", "b", "Bank XYZ is out of cash, withdraw now https://bit.ly/run2", 29),
        ("p3", "c", "Bank XYZ is out of cash, withdraw now https://bit.ly/run3", 28),
        ("p4", "d", "Bank XYZ branch queues are long today", 20),
    ];
    for (id, author, text, minutes) in posts {
        engine.ingest_now(event(id, author, text, minutes)).await.unwrap();
    }

    let first = engine.run_analysis_pass().await.unwrap();
    assert_eq!(first.scored_accounts, 4);
    assert_eq!(first.window_posts, 4);
    assert_eq!(first.graph_version, Some(1));
    assert_eq!(first.bursts, 1);
    assert!(first.narratives_refreshed >= 1);

    let second = engine.run_analysis_pass().await.unwrap();
    assert_eq!(second.graph_version, Some(2));
    assert_eq!(engine.publisher().version(), 2);
    assert_eq!(audit.count(AuditOperation::Partition, AuditOutcome::Succeeded), 2);

    let graph = engine.query().graph(&GraphParams::default()).unwrap();
    assert_eq!(graph.version, 2);
    assert_eq!(graph.as_of, now());
    assert_eq!(graph.bursts.len(), 1);
    assert!(graph.nodes.iter().any(|node| node.id == "a"));

    for narrative in engine.narratives().snapshot() {
        assert!(narrative.risk.is_some());
    }
}

#[tokio::test]
async fn test_recluster_covers_the_clustering_window() {
    let (engine, _) = engine_with(AppConfig::default());
    for i in 0..6 {
        let id = format!("p{i}");
        let author = format!("acct{i}");
        engine
            .ingest_now(event(&id, &author, "Bank XYZ liquidity crisis, savings at risk", 30 - i))
            .await
            .unwrap();
    }
    engine
        .ingest_now(event("old", "z", "Bank XYZ liquidity crisis", 60 * 30))
        .await
        .unwrap();

    let report = engine.recluster().await.unwrap();
    assert_eq!(report.posts, 6);
    assert_eq!(report.clusters, 1);
    assert_eq!(engine.narratives().narrative_of("p0"), engine.narratives().narrative_of("p5"));
}

#[test]
fn test_builder_rejects_mismatched_embedder() {
    let err = Engine::builder(AppConfig::default())
        .embedder(Arc::new(DeterministicEmbedder::new(16)))
        .build()
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::Config(_)));
    assert_eq!(err.error_kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_builder_rejects_invalid_weights() {
    let mut config = AppConfig::default();
    config.risk.weights.bot_ratio = 0.9;
    let err = Engine::from_config(config).err().unwrap();
    assert!(err.to_string().contains("risk weights"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_started_engine_ingests_submitted_events_before_shutdown() {
    let (engine, _) = engine_with(AppConfig::default());
    let engine = Arc::new(engine);
    let handle = Arc::clone(&engine).start().unwrap();

    for i in 0..30 {
        let id = format!("p{i}");
        let author = format!("acct{}", i % 3);
        engine
            .submit(event(&id, &author, "Bank XYZ liquidity crisis, savings at risk", 40 - i))
            .unwrap();
    }
    handle.shutdown().await;

    assert_eq!(engine.pending(), 0);
    assert_eq!(engine.repository().post_count(), 30);
    assert_eq!(engine.narratives().assignment_count(), 30);
    assert!(engine.submit(event("late", "acct0", "after shutdown", 1)).is_err());

    let err = Arc::clone(&engine).start().err().unwrap();
    assert!(matches!(err, EngineError::AlreadyStarted));
}

/// Fails the first `failures` calls, then embeds deterministically.
struct FlakyEmbedder {
    failures: usize,
    calls: AtomicUsize,
    inner: DeterministicEmbedder,
}

impl FlakyEmbedder {
    fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
            inner: DeterministicEmbedder::default(),
        })
    }
}

impl Embedder for FlakyEmbedder {
    fn embed<'a>(
        &'a self,
        text: &'a str,
        model_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<f32>, EmbeddingError>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Box::pin(async { Err(EmbeddingError::Unavailable("model offline".into())) });
        }
        self.inner.embed(text, model_id)
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }
}

fn flaky_engine(failures: usize) -> (Engine, Arc<InMemoryAuditSink>) {
    let mut config = AppConfig::default();
    config.jobs.retry_max_attempts = 2;
    config.jobs.retry_base_delay_ms = 1;
    config.jobs.retry_max_delay_ms = 2;
    let audit = Arc::new(InMemoryAuditSink::default());
    let engine = Engine::builder(config)
        .clock(Arc::new(ManualClock::new(now())))
        .embedder(FlakyEmbedder::failing(failures))
        .audit_sink(audit.clone())
        .build()
        .unwrap();
    (engine, audit)
}

#[tokio::test]
async fn test_redelivered_event_is_clustered_after_dead_letter() {
    let (engine, audit) = flaky_engine(2);
    let raw = event("p1", "a", "Bank XYZ liquidity crisis, withdraw now", 5);

    let err = engine.ingest_now(raw.clone()).await.unwrap_err();
    assert_eq!(err.error_kind(), ErrorKind::EmbeddingTimeout);
    assert_eq!(
        audit.count(AuditOperation::Embed, AuditOutcome::DeadLettered),
        1
    );
    assert!(engine.narratives().narrative_of("p1").is_none());

    let report = engine.ingest_now(raw.clone()).await.unwrap();
    assert!(matches!(report, IngestReport::Assigned { ref post_id, .. } if post_id == "p1"));
    assert!(engine.narratives().narrative_of("p1").is_some());
    assert!(engine.repository().get_post("p1").unwrap().embedding.is_some());
    assert_eq!(engine.index().len(), 1);

    let again = engine.ingest_now(raw).await.unwrap();
    assert_eq!(
        again,
        IngestReport::Duplicate {
            post_id: "p1".to_string()
        }
    );
}

#[tokio::test]
async fn test_replay_dead_letters_assigns_stranded_posts() {
    // two posts exhaust their retries; the model recovers afterwards
    let (engine, _) = flaky_engine(4);
    for (id, minutes) in [("p1", 9), ("p2", 8)] {
        assert!(engine
            .ingest_now(event(id, "a", "Bank XYZ liquidity crisis, withdraw now", minutes))
            .await
            .is_err());
    }
    assert_eq!(engine.repository().unembedded_posts().len(), 2);

    let report = engine.replay_dead_letters().await;
    assert_eq!(report.recovered, 2);
    assert_eq!(report.failed, 0);
    assert!(engine.repository().unembedded_posts().is_empty());
    assert_eq!(
        engine.narratives().narrative_of("p1"),
        engine.narratives().narrative_of("p2")
    );
    assert!(engine.narratives().narrative_of("p1").is_some());

    assert_eq!(engine.replay_dead_letters().await.total(), 0);
}
