use crate::core::{LifecycleEvent, LifecycleKind, Listener, PolicyStore};

/// Applies policy lifecycle events to the shared policy cache.
#[derive(Clone, Debug)]
pub struct CacheListener(PolicyStore);

impl CacheListener {
    pub fn new(store: PolicyStore) -> Self {
        Self(store)
    }
}

#[async_trait::async_trait]
impl Listener<LifecycleEvent> for CacheListener {
    async fn on_event(&self, event: &LifecycleEvent) {
        match event.kind {
            LifecycleKind::Added | LifecycleKind::Updated => self.0.add(event.policy.clone()),
            LifecycleKind::Deleted => self.0.remove(&event.policy.id),
        }
    }
}
