use sentinel_core::model::{AccountId, CommunityEdge, EdgeType};
use std::collections::{BTreeMap, BTreeSet};

/// Typed, undirected account multigraph. Each unordered account pair carries
/// at most one edge per interaction type.
#[derive(Debug, Clone, Default)]
pub struct InteractionGraph {
    nodes: BTreeSet<AccountId>,
    edges: BTreeMap<(AccountId, AccountId, EdgeType), f64>,
}

fn canonical(a: &str, b: &str) -> (AccountId, AccountId) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl InteractionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: &str) {
        if !self.nodes.contains(id) {
            self.nodes.insert(id.to_string());
        }
    }

    /// Accumulates `weight` on the pair's edge of this type. Self loops are ignored.
    pub fn add_edge(&mut self, a: &str, b: &str, edge_type: EdgeType, weight: f64) {
        if a == b || weight <= 0.0 {
            return;
        }
        self.add_node(a);
        self.add_node(b);
        let (lo, hi) = canonical(a, b);
        *self.edges.entry((lo, hi, edge_type)).or_insert(0.0) += weight;
    }

    /// Keeps the larger of the existing and offered weight.
    pub fn raise_edge(&mut self, a: &str, b: &str, edge_type: EdgeType, weight: f64) {
        if a == b || weight <= 0.0 {
            return;
        }
        self.add_node(a);
        self.add_node(b);
        let (lo, hi) = canonical(a, b);
        let slot = self.edges.entry((lo, hi, edge_type)).or_insert(0.0);
        if weight > *slot {
            *slot = weight;
        }
    }

    pub fn edge_weight(&self, a: &str, b: &str, edge_type: EdgeType) -> Option<f64> {
        let (lo, hi) = canonical(a, b);
        self.edges.get(&(lo, hi, edge_type)).copied()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &AccountId> {
        self.nodes.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&AccountId, &AccountId, EdgeType, f64)> {
        self.edges
            .iter()
            .map(|((a, b, edge_type), weight)| (a, b, *edge_type, *weight))
    }

    /// Rescales every edge of `edge_type` by dividing by the type's maximum weight.
    pub fn normalize_type(&mut self, edge_type: EdgeType) {
        let max = self
            .edges
            .iter()
            .filter(|((_, _, t), _)| *t == edge_type)
            .map(|(_, w)| *w)
            .fold(0.0_f64, f64::max);
        if max <= 0.0 {
            return;
        }
        for ((_, _, t), weight) in self.edges.iter_mut() {
            if *t == edge_type {
                *weight /= max;
            }
        }
    }

    /// Symmetric adjacency with parallel edges of all types summed.
    pub fn collapsed(&self) -> BTreeMap<AccountId, BTreeMap<AccountId, f64>> {
        let mut adj: BTreeMap<AccountId, BTreeMap<AccountId, f64>> = self
            .nodes
            .iter()
            .map(|id| (id.clone(), BTreeMap::new()))
            .collect();
        for ((a, b, _), weight) in &self.edges {
            if let Some(row) = adj.get_mut(a) {
                *row.entry(b.clone()).or_insert(0.0) += weight;
            }
            if let Some(row) = adj.get_mut(b) {
                *row.entry(a.clone()).or_insert(0.0) += weight;
            }
        }
        adj
    }

    /// Induced subgraph over `accounts`.
    pub fn subgraph(&self, accounts: &BTreeSet<AccountId>) -> InteractionGraph {
        let mut sub = InteractionGraph::new();
        for id in self.nodes.iter().filter(|id| accounts.contains(*id)) {
            sub.add_node(id);
        }
        for ((a, b, edge_type), weight) in &self.edges {
            if accounts.contains(a) && accounts.contains(b) {
                sub.edges.insert((a.clone(), b.clone(), *edge_type), *weight);
            }
        }
        sub
    }

    pub fn to_edges(&self) -> Vec<CommunityEdge> {
        self.edges()
            .map(|(a, b, edge_type, weight)| CommunityEdge {
                source_account_id: a.clone(),
                target_account_id: b.clone(),
                edge_type,
                weight,
            })
            .collect()
    }
}
