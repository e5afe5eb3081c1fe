use chrono::{DateTime, Duration, Utc};
use rkyv::{Archive, Deserialize, Serialize};
use sentinel_core::audit::{AuditEvent, AuditOperation, AuditOutcome, AuditSink};
use sentinel_core::config::ClusteringConfig;
use sentinel_core::error::{ErrorKind, SentinelError};
use sentinel_core::model::{NarrativeId, Post, PostId};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use storage::index::{IndexError, SimilarityIndex};
use storage::narratives::NarrativeStore;
use storage::repo::StoreError;
use storage::snapshot::{CheckpointError, CheckpointStore};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHECKPOINT_NAME: &str = "recluster";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("post {0} has no embedding")]
    MissingEmbedding(PostId),
    #[error("recluster cancelled after {completed} of {total} posts")]
    Cancelled { completed: usize, total: usize },
    #[error("narrative store error: {0}")]
    Store(#[from] StoreError),
    #[error("similarity index error: {0}")]
    Index(#[from] IndexError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl SentinelError for ClusterError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            ClusterError::MissingEmbedding(_) => ErrorKind::InvalidArgument,
            ClusterError::Cancelled { .. } => ErrorKind::Internal,
            ClusterError::Store(e) => e.error_kind(),
            ClusterError::Index(e) => e.error_kind(),
            ClusterError::Checkpoint(e) => e.error_kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Joined { narrative_id: NarrativeId, similarity: f32 },
    Opened { narrative_id: NarrativeId },
    /// Another writer placed the post first.
    AlreadyAssigned { narrative_id: NarrativeId },
}

impl Assignment {
    pub fn narrative_id(&self) -> &str {
        match self {
            Assignment::Joined { narrative_id, .. }
            | Assignment::Opened { narrative_id }
            | Assignment::AlreadyAssigned { narrative_id } => narrative_id,
        }
    }
}

/// Neighbourhoods of posts `start..start + neighbourhoods.len()` of one
/// window, saved as its own checkpoint file. Only valid for the window whose
/// fingerprint it carries.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct ReclusterBatch {
    pub window: u32,
    pub posts: u32,
    pub start: u32,
    pub neighbourhoods: Vec<Vec<u32>>,
}

/// CRC-32 over the ordered post ids of a recluster window.
pub fn window_fingerprint(post_ids: &[String]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for id in post_ids {
        hasher.update(id.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclusterReport {
    pub posts: usize,
    pub clusters: usize,
    pub noise: usize,
    pub moved: usize,
    pub joined: usize,
    pub opened: usize,
    pub resumed_from: Option<usize>,
}

/// Incremental centroid assignment plus a periodic density recluster that
/// merges and splits narratives. The latest assignment wins; every move
/// made by a recluster is audited.
pub struct NarrativeClusterer {
    store: Arc<NarrativeStore>,
    index: Arc<SimilarityIndex>,
    config: ClusteringConfig,
    audit_sink: Option<Arc<dyn AuditSink>>,
}

impl NarrativeClusterer {
    pub fn new(
        store: Arc<NarrativeStore>,
        index: Arc<SimilarityIndex>,
        config: &ClusteringConfig,
    ) -> Self {
        Self {
            store,
            index,
            config: config.clone(),
            audit_sink: None,
        }
    }

    pub fn set_audit_sink(&mut self, sink: Arc<dyn AuditSink>) {
        self.audit_sink = Some(sink);
    }

    pub fn store(&self) -> &Arc<NarrativeStore> {
        &self.store
    }

    fn window(&self) -> Duration {
        Duration::hours(self.config.window_hours)
    }

    pub fn assign(&self, post: &Post) -> Result<Assignment, ClusterError> {
        let embedding = post
            .embedding
            .as_deref()
            .ok_or_else(|| ClusterError::MissingEmbedding(post.id.clone()))?;

        if let Some(narrative_id) = self.store.narrative_of(&post.id) {
            return Ok(Assignment::AlreadyAssigned { narrative_id });
        }

        let active_since = post.created_at - self.window();
        let result = match self.store.best_match(embedding, active_since) {
            Some((narrative_id, similarity)) if similarity >= self.config.assignment_threshold => self
                .store
                .join(
                    &narrative_id,
                    &post.id,
                    post.created_at,
                    embedding,
                    self.config.max_contention_retries,
                )
                .map(|_| Assignment::Joined {
                    narrative_id,
                    similarity,
                }),
            _ => self
                .store
                .open(&post.id, post.created_at, embedding)
                .map(|narrative_id| Assignment::Opened { narrative_id }),
        };

        match result {
            Ok(assignment) => {
                debug!(post_id = %post.id, narrative_id = %assignment.narrative_id(), "post assigned");
                Ok(assignment)
            }
            Err(StoreError::AlreadyAssigned { narrative_id, .. }) => {
                Ok(Assignment::AlreadyAssigned { narrative_id })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Density pass over `posts`. Neighbourhoods come from the similarity
    /// index restricted to the window and are computed in batches;
    /// cancellation is honoured between batches and each finished batch is
    /// checkpointed on its own, so a later call over the same posts resumes.
    pub async fn recluster(
        &self,
        posts: &[Post],
        checkpoints: Option<&CheckpointStore>,
        cancel: &CancellationToken,
    ) -> Result<ReclusterReport, ClusterError> {
        let mut posts: Vec<&Post> = posts.iter().filter(|p| p.embedding.is_some()).collect();
        posts.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        let post_ids: Vec<String> = posts.iter().map(|p| p.id.clone()).collect();
        let window = window_fingerprint(&post_ids);
        let slots: HashMap<&str, usize> = post_ids
            .iter()
            .enumerate()
            .map(|(slot, id)| (id.as_str(), slot))
            .collect();

        let mut report = ReclusterReport {
            posts: posts.len(),
            ..Default::default()
        };

        let mut neighbourhoods: Vec<Vec<u32>> = Vec::with_capacity(posts.len());
        if let Some(store) = checkpoints {
            for (_, batch) in store.all::<ReclusterBatch>(CHECKPOINT_NAME).await? {
                let fits = batch.window == window
                    && batch.posts as usize == posts.len()
                    && batch.start as usize == neighbourhoods.len();
                if fits {
                    neighbourhoods.extend(batch.neighbourhoods);
                } else {
                    debug!(start = batch.start, "ignoring recluster batch from another window");
                }
            }
            if neighbourhoods.is_empty() {
                store.clear(CHECKPOINT_NAME).await?;
            } else {
                report.resumed_from = Some(neighbourhoods.len());
                info!(resume_at = neighbourhoods.len(), total = posts.len(), "resuming recluster");
            }
        }

        for post in &posts {
            self.index.insert(&post.id, embedding_of(post)?)?;
        }

        let batch_size = self.config.recluster_batch_size.max(1);
        let threshold = self.config.density_similarity;
        let mut start = neighbourhoods.len();
        while start < posts.len() {
            if cancel.is_cancelled() {
                warn!(completed = start, total = posts.len(), "recluster cancelled");
                return Err(ClusterError::Cancelled {
                    completed: start,
                    total: posts.len(),
                });
            }

            let end = (start + batch_size).min(posts.len());
            let mut batch = Vec::with_capacity(end - start);
            for slot in start..end {
                batch.push(self.neighbourhood(&posts, &slots, slot, threshold)?);
            }

            if let Some(store) = checkpoints {
                let saved = ReclusterBatch {
                    window,
                    posts: posts.len() as u32,
                    start: start as u32,
                    neighbourhoods: batch,
                };
                store.save(CHECKPOINT_NAME, start as u64, &saved).await?;
                neighbourhoods.extend(saved.neighbourhoods);
            } else {
                neighbourhoods.extend(batch);
            }
            start = end;
            tokio::task::yield_now().await;
        }

        let labels = density_clusters(&neighbourhoods, self.config.min_samples);
        let clusters = group_clusters(&labels, self.config.min_cluster_size);
        report.clusters = clusters.len();
        report.noise = posts.len() - clusters.iter().map(Vec::len).sum::<usize>();

        self.reconcile(&posts, &clusters, &mut report)?;

        if let Some(store) = checkpoints {
            store.clear(CHECKPOINT_NAME).await?;
        }
        info!(
            posts = report.posts,
            clusters = report.clusters,
            moved = report.moved,
            opened = report.opened,
            "recluster complete"
        );
        Ok(report)
    }

    /// Maps every density cluster onto one narrative. A cluster takes over
    /// the unclaimed narrative that already holds most of its posts, else a
    /// new narrative is opened for it. Noise keeps its current assignment.
    fn reconcile(
        &self,
        posts: &[&Post],
        clusters: &[Vec<usize>],
        report: &mut ReclusterReport,
    ) -> Result<(), ClusterError> {
        let retries = self.config.max_contention_retries;
        let mut claimed: BTreeSet<NarrativeId> = BTreeSet::new();

        for cluster in clusters {
            let mut overlap: BTreeMap<NarrativeId, usize> = BTreeMap::new();
            for idx in cluster {
                if let Some(current) = self.store.narrative_of(&posts[*idx].id) {
                    *overlap.entry(current).or_insert(0) += 1;
                }
            }

            let target = overlap
                .into_iter()
                .filter(|(id, _)| !claimed.contains(id))
                .filter_map(|(id, count)| {
                    let narrative = self.store.get(&id)?;
                    (!narrative.archived).then_some((id, count, narrative.first_seen))
                })
                .min_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)).then(a.0.cmp(&b.0)))
                .map(|(id, _, _)| id);

            let target = match target {
                Some(id) => id,
                None => {
                    let seed = posts[cluster[0]];
                    let embedding = embedding_of(seed)?;
                    let (id, previous) =
                        self.store
                            .split_off(&seed.id, seed.created_at, embedding, retries)?;
                    report.opened += 1;
                    if let Some(previous) = previous {
                        report.moved += 1;
                        self.audit_move(&seed.id, &previous, &id);
                    } else {
                        report.joined += 1;
                    }
                    id
                }
            };
            claimed.insert(target.clone());

            for idx in cluster {
                let post = posts[*idx];
                let embedding = embedding_of(post)?;
                match self.store.narrative_of(&post.id) {
                    Some(current) if current == target => {}
                    Some(_) => {
                        if let Some(previous) = self.store.reassign(
                            &post.id,
                            &target,
                            post.created_at,
                            embedding,
                            retries,
                        )? {
                            report.moved += 1;
                            self.audit_move(&post.id, &previous, &target);
                        }
                    }
                    None => match self.store.join(
                        &target,
                        &post.id,
                        post.created_at,
                        embedding,
                        retries,
                    ) {
                        Ok(_) => report.joined += 1,
                        Err(StoreError::AlreadyAssigned { .. }) => {}
                        Err(e) => return Err(e.into()),
                    },
                }
            }
        }
        Ok(())
    }

    /// Archives narratives with fewer than `min_cluster_size` members inside
    /// the window whose newest member is older than the archive TTL.
    pub fn archive_stale(&self, now: DateTime<Utc>) -> Result<Vec<NarrativeId>, ClusterError> {
        let ttl = Duration::hours(self.config.archive_ttl_hours);
        let since = now - self.window();
        let mut archived = Vec::new();

        for narrative in self.store.snapshot() {
            if narrative.archived {
                continue;
            }
            let active = narrative.members_since(since);
            if active < self.config.min_cluster_size && now - narrative.last_seen > ttl {
                if self
                    .store
                    .archive(&narrative.id, self.config.max_contention_retries)?
                {
                    info!(narrative_id = %narrative.id, active, "narrative archived");
                    archived.push(narrative.id);
                }
            }
        }
        Ok(archived)
    }

    /// Window slots within `threshold` of post `slot`, ascending.
    fn neighbourhood(
        &self,
        posts: &[&Post],
        slots: &HashMap<&str, usize>,
        slot: usize,
        threshold: f32,
    ) -> Result<Vec<u32>, ClusterError> {
        let anchor = embedding_of(posts[slot])?;
        let hits = self.index.query_nearest_where(anchor, posts.len(), threshold, |id| {
            slots.contains_key(id)
        })?;
        let mut neighbours: Vec<u32> = hits
            .iter()
            .filter_map(|(id, _)| slots.get(id.as_str()).copied())
            .filter(|other| *other != slot)
            .map(|other| other as u32)
            .collect();
        neighbours.sort_unstable();
        Ok(neighbours)
    }

    fn audit_move(&self, post_id: &str, from: &str, to: &str) {
        debug!(post_id, from, to, "post reassigned");
        if let Some(sink) = &self.audit_sink {
            let event = AuditEvent::new(AuditOperation::Reassign, AuditOutcome::Succeeded)
                .entity(post_id)
                .with("from", from)
                .with("to", to);
            if let Err(e) = sink.record(event) {
                warn!("failed to record reassignment: {}", e);
            }
        }
    }
}

fn embedding_of(post: &Post) -> Result<&[f32], ClusterError> {
    post.embedding
        .as_deref()
        .ok_or_else(|| ClusterError::MissingEmbedding(post.id.clone()))
}

/// DBSCAN over precomputed neighbourhoods. A point is core when it has at
/// least `min_samples` points (itself included) in its neighbourhood.
/// Returns the cluster label of every point; `None` is noise.
pub fn density_clusters(neighbourhoods: &[Vec<u32>], min_samples: usize) -> Vec<Option<usize>> {
    let is_core: Vec<bool> = neighbourhoods
        .iter()
        .map(|n| n.len() + 1 >= min_samples.max(1))
        .collect();
    let mut labels: Vec<Option<usize>> = vec![None; neighbourhoods.len()];
    let mut next = 0usize;

    for seed in 0..neighbourhoods.len() {
        if labels[seed].is_some() || !is_core[seed] {
            continue;
        }
        let cluster = next;
        next += 1;
        labels[seed] = Some(cluster);

        let mut queue = VecDeque::from([seed]);
        while let Some(point) = queue.pop_front() {
            if !is_core[point] {
                continue;
            }
            for neighbour in &neighbourhoods[point] {
                let neighbour = *neighbour as usize;
                if labels[neighbour].is_none() {
                    labels[neighbour] = Some(cluster);
                    queue.push_back(neighbour);
                }
            }
        }
    }
    labels
}

/// Member indices per cluster in ascending order; undersized clusters are
/// dropped to noise.
fn group_clusters(labels: &[Option<usize>], min_cluster_size: usize) -> Vec<Vec<usize>> {
    let mut grouped: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (idx, label) in labels.iter().enumerate() {
        if let Some(label) = label {
            grouped.entry(*label).or_default().push(idx);
        }
    }
    grouped
        .into_values()
        .filter(|members| members.len() >= min_cluster_size.max(1))
        .collect()
}
