use crate::{
    core::{LifecycleEvent, LifecyclePublisher, Policy, PolicyId, PolicyKind},
    k8s::{self, policy, watcher, Api, DynamicObject, Event, Watch},
    mapper,
    queue::Queue,
    sync::SyncHandle,
    Error, Result,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{task::JoinHandle, time};
use tracing::{debug, info, info_span, warn, Instrument};

/// Fetches the authoritative state of a policy.
#[async_trait::async_trait]
pub trait PolicySource: Send + Sync + 'static {
    /// Returns `None` when the policy no longer exists.
    async fn get(&self, id: &PolicyId) -> Result<Option<DynamicObject>>;
}

#[derive(Clone)]
pub struct KubePolicySource {
    client: k8s::Client,
}

/// Processes queued policy keys, publishing a lifecycle event for each.
pub struct PolicyWatcher<S> {
    source: S,
    publisher: Arc<LifecyclePublisher>,
    queue: Arc<Queue<PolicyId>>,
    seen: Mutex<HashMap<PolicyId, Policy>>,
    max_requeues: u32,
}

// === impl KubePolicySource ===

impl KubePolicySource {
    pub fn new(client: k8s::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl PolicySource for KubePolicySource {
    async fn get(&self, id: &PolicyId) -> Result<Option<DynamicObject>> {
        let api = match id {
            PolicyId::Namespaced { namespace, .. } => {
                Api::<DynamicObject>::namespaced_with(
                    self.client.clone(),
                    namespace,
                    &policy::policies(),
                )
            }
            PolicyId::Cluster { .. } => {
                Api::<DynamicObject>::all_with(self.client.clone(), &policy::cluster_policies())
            }
        };
        api.get_opt(id.name()).await.map_err(Error::from)
    }
}

// === impl PolicyWatcher ===

impl<S: PolicySource> PolicyWatcher<S> {
    pub const MAX_REQUEUES: u32 = 5;

    pub fn new(
        source: S,
        publisher: Arc<LifecyclePublisher>,
        queue: Arc<Queue<PolicyId>>,
    ) -> Self {
        Self {
            source,
            publisher,
            queue,
            seen: Mutex::new(HashMap::new()),
            max_requeues: Self::MAX_REQUEUES,
        }
    }

    /// Spawns `workers` tasks that drain the queue until it is shut down.
    pub fn spawn_workers(self: Arc<Self>, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|n| {
                let this = self.clone();
                tokio::spawn(this.run().instrument(info_span!("worker", n)))
            })
            .collect()
    }

    pub async fn run(self: Arc<Self>) {
        while let Some(id) = self.queue.get().await {
            self.process(&id).await;
            self.queue.done(&id);
        }
        debug!("Queue shut down");
    }

    async fn process(&self, id: &PolicyId) {
        let event = match self.source.get(id).await {
            Ok(Some(obj)) => {
                let policy = mapper::map_policy(&obj);
                match self.seen.lock().insert(id.clone(), policy.clone()) {
                    None => LifecycleEvent::added(policy),
                    Some(old) => LifecycleEvent::updated(policy, Some(old)),
                }
            }
            Ok(None) => {
                let old = self.seen.lock().remove(id);
                LifecycleEvent::deleted(Policy::shell(id.clone()), old)
            }
            Err(error) => {
                if self.queue.num_requeues(id) < self.max_requeues {
                    debug!(%id, %error, "Retrying policy");
                    self.queue.add_rate_limited(id.clone());
                } else {
                    warn!(%id, %error, "Dropping policy out of the queue");
                    self.queue.forget(id);
                }
                return;
            }
        };

        self.queue.forget(id);
        debug!(%id, kind = ?event.kind, "Publishing policy");
        self.publisher.publish(event).await;
    }
}

/// Builds a restarting watch over all policies of the given kind.
pub fn watch_policies(
    client: k8s::Client,
    kind: PolicyKind,
    backoff: time::Duration,
) -> Watch<DynamicObject> {
    let (resource, span) = match kind {
        PolicyKind::Policy => (policy::policies(), info_span!("policies")),
        PolicyKind::ClusterPolicy => (policy::cluster_policies(), info_span!("clusterpolicies")),
    };
    let api = Api::<DynamicObject>::all_with(client, &resource);
    Watch::restarting(move || watcher::watcher(api.clone(), watcher::Config::default()))
        .instrument(span)
        .with_backoff(backoff)
}

/// Feeds the keys of all changed policies into the queue until shutdown.
///
/// A failed stream marks the kind unsynced until the watch is restarted and
/// its re-list completes. On a re-list, every key known before or after the
/// re-list is queued so that deletions missed while the stream was down are
/// detected.
pub async fn run_watch(
    watch: Watch<DynamicObject>,
    queue: Arc<Queue<PolicyId>>,
    sync: SyncHandle,
    shutdown: drain::Watch,
) {
    let failed = sync.clone();
    let restarted = sync.clone();
    let mut watch = watch
        .on_error(move |_| failed.failed())
        .on_restart(move || restarted.syncing());
    let mut known = HashSet::<PolicyId>::new();
    sync.syncing();

    let shutdown = shutdown.signaled();
    tokio::pin!(shutdown);
    loop {
        let ev = tokio::select! {
            ev = watch.recv() => match ev {
                Some(ev) => ev,
                None => {
                    info!("Watch ended");
                    return;
                }
            },
            _ = &mut shutdown => {
                debug!("Shutdown");
                queue.shutdown();
                return;
            }
        };

        match ev {
            Event::Applied(obj) => {
                let id = mapper::policy_id(&obj);
                known.insert(id.clone());
                queue.add(id);
                if sync.was_found() {
                    sync.synced();
                }
            }
            Event::Deleted(obj) => {
                let id = mapper::policy_id(&obj);
                known.remove(&id);
                queue.add(id);
                if sync.was_found() {
                    sync.synced();
                }
            }
            Event::Restarted(objs) => {
                let listed = objs.iter().map(mapper::policy_id).collect::<HashSet<_>>();
                for id in known.union(&listed) {
                    queue.add(id.clone());
                }
                info!(policies = listed.len(), "Synced");
                known = listed;
                sync.synced();
            }
        }
    }
}

#[cfg(test)]
mod tests;
