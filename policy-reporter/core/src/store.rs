use crate::policy::{Policy, PolicyId};
use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Holds the latest known state of every policy.
///
/// Clones share the same underlying map. The map is written only by the cache
/// listener and read by the violation watcher and health checks.
#[derive(Clone, Debug, Default)]
pub struct PolicyStore(Arc<RwLock<HashMap<PolicyId, Policy>>>);

impl PolicyStore {
    pub fn get(&self, id: &PolicyId) -> Option<Policy> {
        self.0.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Policy> {
        self.0.read().values().cloned().collect()
    }

    pub fn add(&self, policy: Policy) {
        self.0.write().insert(policy.id.clone(), policy);
    }

    pub fn remove(&self, id: &PolicyId) {
        self.0.write().remove(id);
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}
