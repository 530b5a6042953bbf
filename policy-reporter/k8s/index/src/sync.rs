use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;

/// Tracks, per watched kind, whether the local view is in sync with the API.
#[derive(Clone, Debug)]
pub struct SyncTracker {
    kinds: Arc<BTreeMap<String, Arc<watch::Sender<Status>>>>,
}

/// Updates the sync status of a single kind.
#[derive(Clone, Debug)]
pub struct SyncHandle {
    tx: Arc<watch::Sender<Status>>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SyncState {
    #[default]
    Unsynced,
    Syncing,
    Synced,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct Status {
    state: SyncState,

    /// Set once the kind has completed its first list and never cleared.
    found: bool,
}

// === impl SyncTracker ===

impl SyncTracker {
    pub fn new<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let kinds = kinds
            .into_iter()
            .map(|k| (k.into(), Arc::new(watch::channel(Status::default()).0)))
            .collect();
        Self {
            kinds: Arc::new(kinds),
        }
    }

    pub fn handle(&self, kind: &str) -> Option<SyncHandle> {
        self.kinds
            .get(kind)
            .map(|tx| SyncHandle { tx: tx.clone() })
    }

    pub fn state(&self, kind: &str) -> Option<SyncState> {
        self.kinds.get(kind).map(|tx| tx.borrow().state)
    }

    /// True only when every kind is currently synced.
    pub fn is_synced(&self) -> bool {
        self.kinds
            .values()
            .all(|tx| tx.borrow().state == SyncState::Synced)
    }

    /// Reports, per kind, whether it has ever completed a sync.
    pub fn found_resources(&self) -> BTreeMap<String, bool> {
        self.kinds
            .iter()
            .map(|(kind, tx)| (kind.clone(), tx.borrow().found))
            .collect()
    }

    /// False only when no kind has ever been found.
    pub fn is_healthy(&self) -> bool {
        self.kinds.is_empty() || self.kinds.values().any(|tx| tx.borrow().found)
    }

    /// Completes once every kind has reached [`SyncState::Synced`].
    pub async fn synced(&self) {
        for tx in self.kinds.values() {
            let mut rx = tx.subscribe();
            // The sender is held by `self`, so the channel cannot close.
            let _ = rx.wait_for(|s| s.state == SyncState::Synced).await;
        }
    }
}

// === impl SyncHandle ===

impl SyncHandle {
    pub fn syncing(&self) {
        self.tx.send_modify(|s| s.state = SyncState::Syncing);
    }

    pub fn synced(&self) {
        self.tx.send_modify(|s| {
            s.state = SyncState::Synced;
            s.found = true;
        });
    }

    pub fn failed(&self) {
        self.tx.send_modify(|s| s.state = SyncState::Unsynced);
    }

    pub fn was_found(&self) -> bool {
        self.tx.borrow().found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use maplit::btreemap;

    #[test]
    fn synced_requires_every_kind() {
        let tracker = SyncTracker::new(["policies", "clusterpolicies"]);
        assert!(!tracker.is_synced());
        assert!(!tracker.is_healthy());

        let policies = tracker.handle("policies").expect("kind must be tracked");
        policies.syncing();
        policies.synced();
        assert!(!tracker.is_synced());
        assert!(tracker.is_healthy());
        assert_eq!(
            tracker.found_resources(),
            btreemap! {
                "clusterpolicies".to_string() => false,
                "policies".to_string() => true,
            }
        );

        tracker
            .handle("clusterpolicies")
            .expect("kind must be tracked")
            .synced();
        assert!(tracker.is_synced());
    }

    #[test]
    fn failure_clears_sync_but_not_found() {
        let tracker = SyncTracker::new(["policies"]);
        let handle = tracker.handle("policies").expect("kind must be tracked");
        handle.synced();
        assert!(tracker.is_synced());

        handle.failed();
        assert!(!tracker.is_synced());
        assert_eq!(tracker.state("policies"), Some(SyncState::Unsynced));
        assert!(tracker.is_healthy());
        assert!(handle.was_found());
    }

    #[tokio::test]
    async fn synced_resolves_once_all_kinds_sync() {
        let tracker = SyncTracker::new(["policies", "clusterpolicies"]);
        let synced = tracker.synced();
        tokio::pin!(synced);
        assert!(synced.as_mut().now_or_never().is_none());

        tracker.handle("policies").expect("tracked").synced();
        assert!(synced.as_mut().now_or_never().is_none());

        tracker.handle("clusterpolicies").expect("tracked").synced();
        synced.await;
    }
}
