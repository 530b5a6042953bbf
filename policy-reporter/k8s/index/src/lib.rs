//! Kyverno policy index
//!
//! Watches `Policy` and `ClusterPolicy` resources and turns every observed
//! change into a policy lifecycle event:
//!
//! ```text
//! [ watch ] -> [ queue ] -> [ worker ] -> [ mapper ] -> [ publisher ] -> { cache, metrics }
//! ```
//!
//! Watch streams only enqueue keys. Workers re-fetch each key so that the
//! published state is always the latest one, and failed fetches are retried
//! with an exponential backoff before being dropped.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod mapper;
pub mod metrics;
pub mod queue;
pub mod store;
pub mod sync;
pub mod watcher;

pub use self::{
    metrics::PolicyMetrics,
    queue::Queue,
    store::CacheListener,
    sync::{SyncHandle, SyncState, SyncTracker},
    watcher::{KubePolicySource, PolicySource, PolicyWatcher},
};
pub use kyverno_policy_reporter_core as core;
pub use kyverno_policy_reporter_k8s_api as k8s;

/// Sync-tracker names of the watched policy kinds.
pub const POLICIES: &str = "policies";
pub const CLUSTER_POLICIES: &str = "clusterpolicies";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to fetch policy: {0}")]
    Api(#[from] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
