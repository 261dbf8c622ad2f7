use std::sync::Arc;

use arc_swap::ArcSwap;

use super::endpoint::Endpoint;

/// One immutable, point-in-time list of endpoints.
pub type Snapshot = Arc<Vec<Endpoint>>;

/// Holder of the current upstream snapshot.
///
/// Writers swap in a whole new list, readers clone the current handle. A
/// reader observes either the list before a replace or the list after it,
/// never a mix, and never waits on the writer's network I/O.
pub struct UpstreamStore {
    current: ArcSwap<Vec<Endpoint>>,
}

impl Default for UpstreamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::new(Arc::new(Vec::new())),
        }
    }

    /// Installs a new snapshot. Concurrent replaces are last-write-wins.
    pub fn replace(&self, endpoints: Vec<Endpoint>) {
        self.current.store(Arc::new(endpoints));
    }

    /// Returns the latest installed snapshot, empty before the first replace.
    pub fn snapshot(&self) -> Snapshot {
        self.current.load_full()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }
}
