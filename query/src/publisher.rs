use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use sentinel_core::model::GraphSnapshot;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Holds the authoritative community graph. Readers take an owned `Arc`, so a
/// publish never tears a response that is already being built; the previous
/// snapshot lives until its last reader drops it.
pub struct SnapshotPublisher {
    current: ArcSwap<GraphSnapshot>,
    publishing: Mutex<()>,
}

impl SnapshotPublisher {
    pub fn new(initial: GraphSnapshot) -> Self {
        Self {
            current: ArcSwap::new(Arc::new(initial)),
            publishing: Mutex::new(()),
        }
    }

    /// Starts with an empty version-0 graph.
    pub fn empty(as_of: DateTime<Utc>) -> Self {
        Self::new(GraphSnapshot::empty(as_of))
    }

    pub fn load(&self) -> Arc<GraphSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Swaps in `snapshot` under the next version number and returns it.
    pub fn publish(&self, mut snapshot: GraphSnapshot) -> u64 {
        let _guard = self
            .publishing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let version = self.current.load().version + 1;
        snapshot.version = version;
        let communities = snapshot.communities.len();
        let nodes = snapshot.nodes.len();
        self.current.store(Arc::new(snapshot));
        info!(version, nodes, communities, "graph snapshot published");
        version
    }
}
