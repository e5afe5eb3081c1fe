use crate::index::InteractionGraph;
use rkyv::{Archive, Deserialize, Serialize};
use sentinel_core::error::{ErrorKind, SentinelError};
use std::collections::{BTreeMap, HashSet, VecDeque};
use thiserror::Error;

const GAIN_EPSILON: f64 = 1e-12;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("community detection cancelled at level {level}")]
    Cancelled { level: usize },
}

impl SentinelError for PartitionError {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::GraphPartitionFailure
    }
}

/// Coarsening state after a completed level. `membership[i]` is the super
/// node of the i-th account in sorted order.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct PartitionCheckpoint {
    pub fingerprint: String,
    pub level: u32,
    pub membership: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionCommunity {
    /// Lowest member id.
    pub label: String,
    pub members: Vec<String>,
    pub modularity: f64,
    pub internal_weight: f64,
    pub external_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Partition {
    pub communities: Vec<PartitionCommunity>,
    pub modularity: f64,
    pub levels: usize,
}

impl Partition {
    pub fn membership(&self) -> BTreeMap<&str, usize> {
        let mut membership = BTreeMap::new();
        for (position, community) in self.communities.iter().enumerate() {
            for member in &community.members {
                membership.insert(member.as_str(), position);
            }
        }
        membership
    }
}

/// Symmetric weighted adjacency over dense indices. Self loops hold the
/// internal weight of aggregated communities.
#[derive(Debug, Clone)]
struct LevelGraph {
    adj: Vec<BTreeMap<usize, f64>>,
    degree: Vec<f64>,
    total: f64,
}

impl LevelGraph {
    fn new(adj: Vec<BTreeMap<usize, f64>>) -> Self {
        let degree: Vec<f64> = adj.iter().map(|row| row.values().sum()).collect();
        let total = degree.iter().sum();
        Self { adj, degree, total }
    }

    fn len(&self) -> usize {
        self.adj.len()
    }

    fn from_interactions(graph: &InteractionGraph) -> (Vec<String>, Self) {
        let collapsed = graph.collapsed();
        let names: Vec<String> = collapsed.keys().cloned().collect();
        let position: BTreeMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.as_str(), idx))
            .collect();

        let adj = collapsed
            .values()
            .map(|row| {
                row.iter()
                    .filter_map(|(neighbor, weight)| {
                        position.get(neighbor.as_str()).map(|idx| (*idx, *weight))
                    })
                    .collect()
            })
            .collect();
        (names, Self::new(adj))
    }

    fn aggregate(&self, assignment: &[usize], count: usize) -> Self {
        let mut adj = vec![BTreeMap::new(); count];
        for (node, row) in self.adj.iter().enumerate() {
            let from = assignment[node];
            for (neighbor, weight) in row {
                *adj[from].entry(assignment[*neighbor]).or_insert(0.0) += weight;
            }
        }
        Self::new(adj)
    }

    fn fingerprint(&self, names: &[String]) -> String {
        let mut hasher = crc32fast::Hasher::new();
        for name in names {
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
        }
        for (node, row) in self.adj.iter().enumerate() {
            for (neighbor, weight) in row {
                hasher.update(&(node as u64).to_le_bytes());
                hasher.update(&(*neighbor as u64).to_le_bytes());
                hasher.update(&weight.to_bits().to_le_bytes());
            }
        }
        format!("{:08x}-{}", hasher.finalize(), names.len())
    }
}

/// Deterministic multi-level modularity optimisation (Louvain local moving
/// plus aggregation), with a connectivity refinement on the final partition.
///
/// Nodes are visited in sorted id order. Equal modularity gains resolve to the
/// candidate whose concatenated `node-id + community-id` pair is lowest, and a
/// node only leaves its community for a strictly better one.
#[derive(Debug, Clone)]
pub struct LouvainPartitioner {
    pub max_levels: usize,
    pub max_passes: usize,
}

impl Default for LouvainPartitioner {
    fn default() -> Self {
        Self {
            max_levels: 8,
            max_passes: 20,
        }
    }
}

impl LouvainPartitioner {
    pub fn new(max_levels: usize, max_passes: usize) -> Self {
        Self {
            max_levels: max_levels.max(1),
            max_passes: max_passes.max(1),
        }
    }

    pub fn partition(&self, graph: &InteractionGraph) -> Partition {
        match self.partition_with(graph, None, &|| false, &mut |_: &PartitionCheckpoint| {}) {
            Ok(partition) => partition,
            Err(PartitionError::Cancelled { .. }) => Partition::default(),
        }
    }

    /// Runs the partitioner, emitting a checkpoint after every completed
    /// level. A checkpoint whose fingerprint matches `graph` resumes from
    /// its level; a stale one is ignored.
    pub fn partition_with(
        &self,
        graph: &InteractionGraph,
        resume: Option<&PartitionCheckpoint>,
        is_cancelled: &dyn Fn() -> bool,
        on_level: &mut dyn FnMut(&PartitionCheckpoint),
    ) -> Result<Partition, PartitionError> {
        let (names, base) = LevelGraph::from_interactions(graph);
        if names.is_empty() {
            return Ok(Partition::default());
        }
        let fingerprint = base.fingerprint(&names);

        let mut membership: Vec<usize> = (0..names.len()).collect();
        let mut current = base.clone();
        let mut start_level = 0usize;

        if let Some(checkpoint) = resume {
            if checkpoint.fingerprint == fingerprint && checkpoint.membership.len() == names.len() {
                membership = checkpoint.membership.iter().map(|s| *s as usize).collect();
                let count = membership.iter().copied().max().map(|m| m + 1).unwrap_or(0);
                current = base.aggregate(&membership, count);
                start_level = checkpoint.level as usize;
                tracing::debug!(level = start_level, "resuming community detection");
            } else {
                tracing::debug!("ignoring stale partition checkpoint");
            }
        }

        let mut levels = start_level;
        for level in start_level..self.max_levels {
            if is_cancelled() {
                return Err(PartitionError::Cancelled { level });
            }

            let labels = super_node_labels(&names, &membership, current.len());
            let (assignment, moved) =
                local_moving(&current, &labels, self.max_passes, is_cancelled, level)?;
            if !moved {
                break;
            }

            let (compacted, count) = compact(&assignment);
            for slot in membership.iter_mut() {
                *slot = compacted[*slot];
            }
            current = current.aggregate(&compacted, count);
            levels = level + 1;

            on_level(&PartitionCheckpoint {
                fingerprint: fingerprint.clone(),
                level: levels as u32,
                membership: membership.iter().map(|s| *s as u32).collect(),
            });
        }

        let refined = refine_connected_communities(&base, &membership);
        Ok(summarize(&names, &base, &refined, levels))
    }
}

/// Super nodes are numbered in order of their lowest original member, so the
/// label of super node `s` is the lowest name that maps to it.
fn super_node_labels(names: &[String], membership: &[usize], count: usize) -> Vec<String> {
    let mut labels: Vec<Option<String>> = vec![None; count];
    for (idx, super_node) in membership.iter().enumerate() {
        if labels[*super_node].is_none() {
            labels[*super_node] = Some(names[idx].clone());
        }
    }
    labels.into_iter().map(|l| l.unwrap_or_default()).collect()
}

fn local_moving(
    graph: &LevelGraph,
    labels: &[String],
    max_passes: usize,
    is_cancelled: &dyn Fn() -> bool,
    level: usize,
) -> Result<(Vec<usize>, bool), PartitionError> {
    let mut assignment: Vec<usize> = (0..graph.len()).collect();
    if graph.total <= f64::EPSILON {
        return Ok((assignment, false));
    }

    let mut totals = graph.degree.clone();
    let m2 = graph.total;
    let mut any_moved = false;

    for _ in 0..max_passes {
        if is_cancelled() {
            return Err(PartitionError::Cancelled { level });
        }
        let mut moved = false;

        for node in 0..graph.len() {
            let current = assignment[node];
            let k = graph.degree[node];

            let mut links: BTreeMap<usize, f64> = BTreeMap::new();
            for (neighbor, weight) in &graph.adj[node] {
                if *neighbor != node {
                    *links.entry(assignment[*neighbor]).or_insert(0.0) += weight;
                }
            }

            totals[current] -= k;
            let mut best = current;
            let mut best_gain =
                links.get(&current).copied().unwrap_or(0.0) - totals[current] * k / m2;

            for (candidate, weight) in &links {
                if *candidate == current {
                    continue;
                }
                let gain = weight - totals[*candidate] * k / m2;
                let better = gain > best_gain + GAIN_EPSILON;
                let tied = (gain - best_gain).abs() <= GAIN_EPSILON
                    && best != current
                    && pair_key(labels, node, *candidate) < pair_key(labels, node, best);
                if better || tied {
                    best = *candidate;
                    best_gain = gain;
                }
            }

            totals[best] += k;
            if best != current {
                assignment[node] = best;
                moved = true;
                any_moved = true;
            }
        }

        if !moved {
            break;
        }
    }

    Ok((assignment, any_moved))
}

fn pair_key(labels: &[String], node: usize, community: usize) -> String {
    format!("{}{}", labels[node], labels[community])
}

/// Renumbers communities by first appearance in node order.
fn compact(assignment: &[usize]) -> (Vec<usize>, usize) {
    let mut remap: BTreeMap<usize, usize> = BTreeMap::new();
    let mut compacted = vec![0; assignment.len()];
    for (node, community) in assignment.iter().enumerate() {
        let next = remap.len();
        compacted[node] = *remap.entry(*community).or_insert(next);
    }
    (compacted, remap.len())
}

fn refine_connected_communities(base: &LevelGraph, membership: &[usize]) -> Vec<Vec<usize>> {
    let mut by_community: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (node, community) in membership.iter().enumerate() {
        by_community.entry(*community).or_default().push(node);
    }

    let mut refined = Vec::new();
    for nodes in by_community.into_values() {
        refined.extend(connected_components(&nodes, base));
    }
    refined.sort_by_key(|component| component[0]);
    refined
}

fn connected_components(nodes: &[usize], graph: &LevelGraph) -> Vec<Vec<usize>> {
    let target: HashSet<usize> = nodes.iter().copied().collect();
    let mut visited = HashSet::new();
    let mut components = Vec::new();

    for start in nodes.iter().copied() {
        if !visited.insert(start) {
            continue;
        }
        let mut queue = VecDeque::from([start]);
        let mut component = Vec::new();

        while let Some(node) = queue.pop_front() {
            component.push(node);
            for neighbor in graph.adj[node].keys() {
                if target.contains(neighbor) && visited.insert(*neighbor) {
                    queue.push_back(*neighbor);
                }
            }
        }

        component.sort_unstable();
        components.push(component);
    }

    components
}

fn summarize(
    names: &[String],
    base: &LevelGraph,
    components: &[Vec<usize>],
    levels: usize,
) -> Partition {
    let mut owner = vec![0usize; names.len()];
    for (community, nodes) in components.iter().enumerate() {
        for node in nodes {
            owner[*node] = community;
        }
    }

    let m2 = base.total;
    let mut communities = Vec::with_capacity(components.len());
    let mut modularity = 0.0;

    for (community, nodes) in components.iter().enumerate() {
        let mut inside = 0.0;
        let mut total = 0.0;
        for node in nodes {
            total += base.degree[*node];
            for (neighbor, weight) in &base.adj[*node] {
                if owner[*neighbor] == community {
                    inside += weight;
                }
            }
        }

        let q = if m2 > f64::EPSILON {
            inside / m2 - (total / m2).powi(2)
        } else {
            0.0
        };
        modularity += q;

        communities.push(PartitionCommunity {
            label: names[nodes[0]].clone(),
            members: nodes.iter().map(|node| names[*node].clone()).collect(),
            modularity: q,
            internal_weight: inside / 2.0,
            external_weight: total - inside,
        });
    }

    Partition {
        communities,
        modularity,
        levels,
    }
}
