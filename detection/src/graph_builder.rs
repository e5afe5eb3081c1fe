use chrono::{DateTime, Utc};
use sentinel_core::config::GraphConfig;
use sentinel_core::embedding::cosine_similarity;
use sentinel_core::error::{ErrorKind, SentinelError};
use sentinel_core::model::{
    AccountId, BurstKind, Community, CommunityClass, CoordinationBurst, EdgeType, GraphSnapshot,
    Post,
};
use std::collections::{BTreeMap, BTreeSet};
use storage::community::{LouvainPartitioner, Partition, PartitionCheckpoint, PartitionError};
use storage::index::InteractionGraph;
use storage::repo::Repository;
use storage::snapshot::{CheckpointError, CheckpointStore};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const CHECKPOINT_NAME: &str = "partition";

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("partition failed: {0}")]
    Partition(#[from] PartitionError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl SentinelError for GraphError {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::GraphPartitionFailure
    }
}

/// Interaction graph for one analysis window plus the coordination bursts
/// found while sweeping it.
#[derive(Debug, Clone, Default)]
pub struct GraphBuild {
    pub graph: InteractionGraph,
    pub bursts: Vec<CoordinationBurst>,
}

struct NearDuplicate {
    earlier: usize,
    later: usize,
    similarity: f64,
}

pub struct GraphBuilder {
    config: GraphConfig,
    partitioner: LouvainPartitioner,
}

impl GraphBuilder {
    pub fn new(config: &GraphConfig) -> Self {
        Self {
            config: config.clone(),
            partitioner: LouvainPartitioner::new(config.max_levels, config.max_passes),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Every author in `posts` becomes a node. RETWEET, REPLY and MENTION
    /// weights are interaction counts scaled by the per-type maximum;
    /// SIMILAR_TEXT weights are the best cosine seen between two accounts.
    pub fn build(&self, posts: &[Post], repo: &Repository) -> GraphBuild {
        let mut posts: Vec<&Post> = posts.iter().collect();
        posts.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let mut graph = InteractionGraph::new();
        for post in &posts {
            graph.add_node(&post.author_id);

            if let Some(target) = post.retweet_of.as_deref().and_then(|id| repo.author_of(id)) {
                graph.add_edge(&post.author_id, &target, EdgeType::Retweet, 1.0);
            }
            if let Some(target) = post.reply_to.as_deref().and_then(|id| repo.author_of(id)) {
                graph.add_edge(&post.author_id, &target, EdgeType::Reply, 1.0);
            }
            for mentioned in &post.mentions {
                graph.add_edge(&post.author_id, mentioned, EdgeType::Mention, 1.0);
            }
        }
        for edge_type in [EdgeType::Retweet, EdgeType::Reply, EdgeType::Mention] {
            graph.normalize_type(edge_type);
        }

        let pairs = self.similar_text_sweep(&posts, &mut graph);

        let mut bursts = self.exact_bursts(&posts);
        bursts.extend(self.semantic_bursts(&posts, &pairs));
        debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            bursts = bursts.len(),
            "interaction graph built"
        );

        GraphBuild { graph, bursts }
    }

    /// Compares each post with the earlier posts inside the similarity
    /// window, newest first, up to the candidate cap.
    fn similar_text_sweep(&self, posts: &[&Post], graph: &mut InteractionGraph) -> Vec<NearDuplicate> {
        let window = self.config.similar_text_window_secs;
        let threshold = self.config.similar_text_threshold;
        let mut pairs = Vec::new();

        for later in 0..posts.len() {
            let post = posts[later];
            let Some(vector) = post.embedding.as_deref() else {
                continue;
            };

            let mut compared = 0usize;
            for earlier in (0..later).rev() {
                let candidate = posts[earlier];
                if (post.created_at - candidate.created_at).num_seconds() > window
                    || compared >= self.config.similar_text_max_candidates
                {
                    break;
                }
                if candidate.author_id == post.author_id {
                    continue;
                }
                let Some(other) = candidate.embedding.as_deref() else {
                    continue;
                };
                compared += 1;

                let Some(similarity) = cosine_similarity(vector, other) else {
                    continue;
                };
                if similarity >= threshold {
                    let weight = (similarity as f64).min(1.0);
                    graph.raise_edge(
                        &post.author_id,
                        &candidate.author_id,
                        EdgeType::SimilarText,
                        weight,
                    );
                    pairs.push(NearDuplicate {
                        earlier,
                        later,
                        similarity: weight,
                    });
                }
            }
        }
        pairs
    }

    /// Identical text (by hash) from enough distinct accounts inside one
    /// window. Windows are anchored at their first post and do not overlap.
    fn exact_bursts(&self, posts: &[&Post]) -> Vec<CoordinationBurst> {
        let mut by_hash: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (idx, post) in posts.iter().enumerate() {
            by_hash.entry(post.text_hash.as_str()).or_default().push(idx);
        }

        let mut bursts = Vec::new();
        for group in by_hash.values() {
            let mut start = 0usize;
            while start < group.len() {
                let anchor = posts[group[start]].created_at;
                let mut end = start;
                while end + 1 < group.len()
                    && (posts[group[end + 1]].created_at - anchor).num_seconds()
                        <= self.config.similar_text_window_secs
                {
                    end += 1;
                }

                let members = &group[start..=end];
                if distinct_accounts(posts, members).len() >= self.config.burst_min_accounts {
                    bursts.push(burst(BurstKind::ExactMatch, posts, members, 1.0));
                    start = end + 1;
                } else {
                    start += 1;
                }
            }
        }
        bursts
    }

    /// Near-duplicate pairs of different text chained into components.
    fn semantic_bursts(&self, posts: &[&Post], pairs: &[NearDuplicate]) -> Vec<CoordinationBurst> {
        let mut parent: Vec<usize> = (0..posts.len()).collect();
        let mut linked = BTreeSet::new();
        for pair in pairs {
            if posts[pair.earlier].text_hash == posts[pair.later].text_hash {
                continue;
            }
            let a = find(&mut parent, pair.earlier);
            let b = find(&mut parent, pair.later);
            if a != b {
                parent[a.max(b)] = a.min(b);
            }
            linked.insert(pair.earlier);
            linked.insert(pair.later);
        }

        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for idx in linked {
            let root = find(&mut parent, idx);
            components.entry(root).or_default().push(idx);
        }

        let mut similarity_sums: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
        for pair in pairs {
            if posts[pair.earlier].text_hash == posts[pair.later].text_hash {
                continue;
            }
            let root = find(&mut parent, pair.earlier);
            let entry = similarity_sums.entry(root).or_insert((0.0, 0));
            entry.0 += pair.similarity;
            entry.1 += 1;
        }

        components
            .into_iter()
            .filter(|(_, members)| {
                distinct_accounts(posts, members).len() >= self.config.burst_min_accounts
            })
            .map(|(root, members)| {
                let (sum, count) = similarity_sums.get(&root).copied().unwrap_or((0.0, 0));
                let average = if count == 0 { 0.0 } else { sum / count as f64 };
                burst(BurstKind::SemanticSimilarity, posts, &members, average)
            })
            .collect()
    }

    pub fn partition(&self, graph: &InteractionGraph) -> Partition {
        self.partitioner.partition(graph)
    }

    /// Partitions with level checkpoints. An interrupted run leaves its last
    /// completed level on disk and the next run over the same graph resumes
    /// from it.
    pub async fn partition_resumable(
        &self,
        graph: &InteractionGraph,
        checkpoints: Option<&CheckpointStore>,
        cancel: &CancellationToken,
    ) -> Result<Partition, GraphError> {
        let resume = match checkpoints {
            Some(store) => store
                .latest::<PartitionCheckpoint>(CHECKPOINT_NAME)
                .await?
                .map(|(_, checkpoint)| checkpoint),
            None => None,
        };

        let mut last: Option<PartitionCheckpoint> = None;
        let result = self.partitioner.partition_with(
            graph,
            resume.as_ref(),
            &|| cancel.is_cancelled(),
            &mut |checkpoint: &PartitionCheckpoint| last = Some(checkpoint.clone()),
        );

        match result {
            Ok(partition) => {
                if let Some(store) = checkpoints {
                    store.clear(CHECKPOINT_NAME).await?;
                }
                Ok(partition)
            }
            Err(e) => {
                if let (Some(store), Some(checkpoint)) = (checkpoints, last) {
                    store
                        .save(CHECKPOINT_NAME, checkpoint.level as u64, &checkpoint)
                        .await?;
                }
                Err(e.into())
            }
        }
    }

    /// Labels each community from its members' bot scores and how much
    /// denser it is inside than across its boundary.
    pub fn classify(
        &self,
        mean_bot_score: f64,
        internal_density: f64,
        external_density: f64,
    ) -> CommunityClass {
        if mean_bot_score >= self.config.bot_community_threshold
            && internal_density >= external_density
        {
            CommunityClass::Bot
        } else if mean_bot_score < self.config.organic_community_threshold {
            CommunityClass::Organic
        } else {
            CommunityClass::Hybrid
        }
    }

    /// Internal weight per member pair and cut weight per member-outsider
    /// pair. Either is zero when it has no pairs.
    pub fn edge_densities(
        members: usize,
        graph_nodes: usize,
        internal_weight: f64,
        external_weight: f64,
    ) -> (f64, f64) {
        let n = members as f64;
        let inside_pairs = n * (n - 1.0) / 2.0;
        let boundary_pairs = n * graph_nodes.saturating_sub(members) as f64;
        let per_pair = |weight: f64, pairs: f64| if pairs > 0.0 { weight / pairs } else { 0.0 };
        (
            per_pair(internal_weight, inside_pairs),
            per_pair(external_weight, boundary_pairs),
        )
    }

    /// Turns a partition into the published snapshot.
    pub fn snapshot(
        &self,
        build: GraphBuild,
        partition: &Partition,
        repo: &Repository,
        built_at: DateTime<Utc>,
    ) -> GraphSnapshot {
        let mut communities = Vec::with_capacity(partition.communities.len());
        let mut membership: BTreeMap<AccountId, String> = BTreeMap::new();
        let graph_nodes = build.graph.node_count();

        for found in &partition.communities {
            let id = format!("com-{}", found.label);
            let scores: Vec<f64> = found
                .members
                .iter()
                .map(|member| repo.bot_score(member).map(|s| s.score).unwrap_or(0.0))
                .collect();
            let mean_bot_score = if scores.is_empty() {
                0.0
            } else {
                scores.iter().sum::<f64>() / scores.len() as f64
            };

            let (internal_density, external_density) = Self::edge_densities(
                found.members.len(),
                graph_nodes,
                found.internal_weight,
                found.external_weight,
            );

            for member in &found.members {
                membership.insert(member.clone(), id.clone());
            }
            communities.push(Community {
                id,
                member_account_ids: found.members.iter().cloned().collect(),
                modularity: found.modularity,
                classification: self.classify(mean_bot_score, internal_density, external_density),
                mean_bot_score,
                internal_weight: found.internal_weight,
                external_weight: found.external_weight,
            });
        }
        communities.sort_by(|a, b| a.id.cmp(&b.id));

        info!(
            communities = communities.len(),
            modularity = partition.modularity,
            "graph snapshot built"
        );

        GraphSnapshot {
            version: 0,
            built_at,
            nodes: build.graph.node_ids().cloned().collect(),
            edges: build.graph.to_edges(),
            communities,
            membership,
            modularity: partition.modularity,
            bursts: build.bursts,
        }
    }
}

fn find(parent: &mut [usize], mut idx: usize) -> usize {
    while parent[idx] != idx {
        parent[idx] = parent[parent[idx]];
        idx = parent[idx];
    }
    idx
}

fn distinct_accounts<'a>(posts: &[&'a Post], members: &[usize]) -> BTreeSet<&'a str> {
    members
        .iter()
        .map(|idx| posts[*idx].author_id.as_str())
        .collect()
}

fn burst(kind: BurstKind, posts: &[&Post], members: &[usize], avg_similarity: f64) -> CoordinationBurst {
    let first = members
        .iter()
        .map(|idx| posts[*idx].created_at)
        .min()
        .unwrap_or_default();
    let last = members
        .iter()
        .map(|idx| posts[*idx].created_at)
        .max()
        .unwrap_or_default();

    CoordinationBurst {
        kind,
        account_ids: distinct_accounts(posts, members)
            .into_iter()
            .map(str::to_string)
            .collect(),
        post_ids: members.iter().map(|idx| posts[*idx].id.clone()).collect(),
        time_span_seconds: (last - first).num_seconds(),
        avg_similarity,
    }
}
