use crate::embedding::{DeterministicEmbedder, Embedder};
use crate::error::IngestionError;
use crate::normalizer::{normalize, RawEvent};
use jobs::retry::{retry_transient, RetryPolicy};
use sentinel_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink};
use sentinel_core::clock::{Clock, SystemClock};
use sentinel_core::config::AppConfig;
use sentinel_core::error::{ErrorKind, SentinelError};
use sentinel_core::model::Post;
use std::sync::Arc;
use std::time::Duration;
use storage::index::SimilarityIndex;
use storage::repo::{InsertOutcome, Repository};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Newly stored post, embedding attached.
    Ingested(Post),
    /// Stored by an earlier delivery whose embedding never completed; the
    /// embedding is attached now.
    Resumed(Post),
    /// The id was seen before; nothing changed.
    Duplicate { post_id: String },
}

/// Normalize → store (idempotent) → upsert account → embed → index.
pub struct IngestionPipeline {
    repo: Arc<Repository>,
    index: Arc<SimilarityIndex>,
    embedder: Arc<dyn Embedder>,
    clock: Arc<dyn Clock>,
    model_id: String,
    embedding_timeout: Duration,
    max_future_skew: chrono::Duration,
    retry: RetryPolicy,
    audit_sink: Option<Arc<dyn AuditSink>>,
    dead_letter_sink: Option<Arc<dyn AuditSink>>,
}

impl IngestionPipeline {
    pub fn new(repo: Arc<Repository>, index: Arc<SimilarityIndex>, config: &AppConfig) -> Self {
        Self::with_components(
            repo,
            index,
            Arc::new(DeterministicEmbedder::new(config.ingestion.embedding_dims)),
            Arc::new(SystemClock),
            config,
        )
    }

    pub fn with_components(
        repo: Arc<Repository>,
        index: Arc<SimilarityIndex>,
        embedder: Arc<dyn Embedder>,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
    ) -> Self {
        Self {
            repo,
            index,
            embedder,
            clock,
            model_id: config.ingestion.model_id.clone(),
            embedding_timeout: Duration::from_millis(config.ingestion.embedding_timeout_ms),
            max_future_skew: chrono::Duration::seconds(config.ingestion.max_future_skew_secs),
            retry: RetryPolicy::from_config(&config.jobs),
            audit_sink: None,
            dead_letter_sink: None,
        }
    }

    pub fn set_audit_sink(&mut self, sink: Arc<dyn AuditSink>) {
        self.audit_sink = Some(sink);
    }

    pub fn set_dead_letter_sink(&mut self, sink: Arc<dyn AuditSink>) {
        self.dead_letter_sink = Some(sink);
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    pub async fn ingest(&self, raw: RawEvent) -> Result<IngestOutcome, IngestionError> {
        let event = match normalize(&raw, self.clock.now(), self.max_future_skew) {
            Ok(event) => event,
            Err(e) => {
                warn!(platform = %raw.platform, "dropping malformed event: {}", e);
                self.audit(
                    AuditEvent::new(AuditOperation::Ingest, AuditOutcome::Dropped)
                        .kind(ErrorKind::MalformedEvent)
                        .with("platform", raw.platform.clone())
                        .with("reason", e.to_string()),
                );
                return Err(e);
            }
        };

        let mut post = event.post;
        for handle in &event.mention_handles {
            match self.repo.resolve_handle(handle) {
                Some(account_id) if account_id != post.author_id => {
                    if !post.mentions.contains(&account_id) {
                        post.mentions.push(account_id);
                    }
                }
                Some(_) => {}
                None => debug!(post_id = %post.id, handle = %handle, "unresolved mention"),
            }
        }

        if self.repo.insert_post(post.clone(), &event.author) == InsertOutcome::Duplicate {
            return match self.repo.get_post(&post.id) {
                Some(mut stored) if stored.embedding.is_none() => {
                    info!(post_id = %stored.id, "redelivered post still unembedded, resuming");
                    stored.embedding = Some(self.embed_post(&stored).await?);
                    Ok(IngestOutcome::Resumed(stored))
                }
                _ => {
                    debug!(post_id = %post.id, "duplicate post ignored");
                    Ok(IngestOutcome::Duplicate { post_id: post.id })
                }
            };
        }

        post.embedding = Some(self.embed_post(&post).await?);
        Ok(IngestOutcome::Ingested(post))
    }

    /// Embeds a stored post and makes it searchable. Used on first ingest, on
    /// redelivery of a post whose embedding failed, and when replaying dead
    /// letters.
    pub async fn embed_post(&self, post: &Post) -> Result<Vec<f32>, IngestionError> {
        if let Some(existing) = self.repo.get_post(&post.id).and_then(|p| p.embedding) {
            return Ok(existing);
        }

        let timeout_ms = self.embedding_timeout.as_millis() as u64;
        let result = retry_transient(&self.retry, "embed", |_| async move {
            match tokio::time::timeout(
                self.embedding_timeout,
                self.embedder.embed(&post.text, &self.model_id),
            )
            .await
            {
                Ok(Ok(vector)) => Ok(vector),
                Ok(Err(e)) => Err(IngestionError::Embedding(e)),
                Err(_) => Err(IngestionError::EmbeddingTimeout {
                    post_id: post.id.clone(),
                    timeout_ms,
                }),
            }
        })
        .await;

        let embedding = match result {
            Ok(embedding) => embedding,
            Err(failure) => {
                let attempts = failure.attempts();
                let exhausted = failure.is_exhausted();
                let e = failure.into_inner();
                if exhausted {
                    error!(post_id = %post.id, attempts, "embedding dead-lettered: {}", e);
                    self.dead_letter(
                        AuditEvent::new(AuditOperation::Embed, AuditOutcome::DeadLettered)
                            .entity(post.id.clone())
                            .kind(e.error_kind())
                            .with("attempts", attempts.to_string())
                            .with("reason", e.to_string()),
                    );
                } else {
                    error!(post_id = %post.id, "embedding failed: {}", e);
                    self.audit(
                        AuditEvent::new(AuditOperation::Embed, AuditOutcome::Failed)
                            .entity(post.id.clone())
                            .kind(e.error_kind())
                            .with("reason", e.to_string()),
                    );
                }
                return Err(e);
            }
        };

        self.repo.attach_embedding(&post.id, embedding.clone())?;
        self.index.insert(&post.id, &embedding)?;
        Ok(embedding)
    }

    fn audit(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit_sink {
            if let Err(e) = sink.record(event) {
                warn!("failed to record audit event: {}", e);
            }
        }
    }

    fn dead_letter(&self, event: AuditEvent) {
        match &self.dead_letter_sink {
            Some(sink) => {
                if let Err(e) = sink.record(event) {
                    error!("failed to write dead letter: {}", e);
                }
            }
            None => self.audit(event),
        }
    }
}
