use super::*;
use crate::{core::LifecycleKind, sync::SyncTracker};
use futures::{stream, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone, Debug)]
enum Fetch {
    Found(DynamicObject),
    Missing,
    Fail,
}

#[derive(Default)]
struct FakeSource {
    objects: Mutex<HashMap<PolicyId, Fetch>>,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl PolicySource for Arc<FakeSource> {
    async fn get(&self, id: &PolicyId) -> Result<Option<DynamicObject>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.objects.lock().get(id).cloned() {
            Some(Fetch::Found(obj)) => Ok(Some(obj)),
            Some(Fetch::Missing) | None => Ok(None),
            Some(Fetch::Fail) => Err(Error::Api(kube::Error::Api(
                kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "etcdserver: request timed out".to_string(),
                    reason: "InternalError".to_string(),
                    code: 500,
                },
            ))),
        }
    }
}

type Recorded = Arc<Mutex<Vec<(LifecycleKind, Policy, Option<Policy>)>>>;

fn policy_object(namespace: &str, name: &str, severity: &str) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "kyverno.io/v1",
        "kind": "Policy",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "annotations": { "policies.kyverno.io/severity": severity },
        },
        "spec": { "rules": [{ "name": "check", "validate": { "message": "denied" } }] },
    }))
    .expect("fixture must be a valid object")
}

fn cluster_policy_object(name: &str) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "kyverno.io/v1",
        "kind": "ClusterPolicy",
        "metadata": { "name": name },
    }))
    .expect("fixture must be a valid object")
}

fn policy_watcher() -> (Arc<FakeSource>, Arc<PolicyWatcher<Arc<FakeSource>>>, Recorded) {
    let source = Arc::new(FakeSource::default());
    let publisher = LifecyclePublisher::shared();
    let recorded = Recorded::default();
    let r = recorded.clone();
    publisher.register_fn(move |ev: &LifecycleEvent| {
        r.lock()
            .push((ev.kind, ev.policy.clone(), ev.old.clone()));
    });
    let watcher = Arc::new(PolicyWatcher::new(
        source.clone(),
        publisher,
        Queue::shared(),
    ));
    (source, watcher, recorded)
}

#[tokio::test]
async fn classifies_added_updated_deleted() {
    let (source, watcher, recorded) = policy_watcher();
    let id = PolicyId::namespaced("test", "require-requests");

    source.objects.lock().insert(
        id.clone(),
        Fetch::Found(policy_object("test", "require-requests", "low")),
    );
    watcher.process(&id).await;

    source.objects.lock().insert(
        id.clone(),
        Fetch::Found(policy_object("test", "require-requests", "high")),
    );
    watcher.process(&id).await;

    source.objects.lock().insert(id.clone(), Fetch::Missing);
    watcher.process(&id).await;

    let recorded = recorded.lock();
    assert_eq!(recorded.len(), 3);

    let (kind, policy, old) = &recorded[0];
    assert_eq!(*kind, LifecycleKind::Added);
    assert_eq!(policy.severity, "low");
    assert_eq!(policy.rules.len(), 1);
    assert_eq!(*old, None);

    let (kind, policy, old) = &recorded[1];
    assert_eq!(*kind, LifecycleKind::Updated);
    assert_eq!(policy.severity, "high");
    assert_eq!(old.as_ref().map(|p| p.severity.as_str()), Some("low"));

    let (kind, policy, old) = &recorded[2];
    assert_eq!(*kind, LifecycleKind::Deleted);
    assert_eq!(*policy, Policy::shell(id.clone()));
    assert_eq!(old.as_ref().map(|p| p.severity.as_str()), Some("high"));
}

#[tokio::test]
async fn namespaced_and_cluster_policies_do_not_collide() {
    let (source, watcher, recorded) = policy_watcher();
    let ns = PolicyId::namespaced("test", "disallow-latest");
    let cluster = PolicyId::cluster("disallow-latest");
    source.objects.lock().insert(
        ns.clone(),
        Fetch::Found(policy_object("test", "disallow-latest", "low")),
    );
    source.objects.lock().insert(
        cluster.clone(),
        Fetch::Found(cluster_policy_object("disallow-latest")),
    );

    watcher.process(&ns).await;
    watcher.process(&cluster).await;

    let kinds = recorded
        .lock()
        .iter()
        .map(|(kind, policy, _)| (*kind, policy.kind))
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            (LifecycleKind::Added, PolicyKind::Policy),
            (LifecycleKind::Added, PolicyKind::ClusterPolicy),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn fetch_errors_are_retried_then_dropped() {
    let (source, watcher, recorded) = policy_watcher();
    let id = PolicyId::cluster("require-labels");
    source.objects.lock().insert(id.clone(), Fetch::Fail);

    let queue = watcher.queue.clone();
    let workers = watcher.clone().spawn_workers(2);
    queue.add(id.clone());

    time::sleep(time::Duration::from_secs(10)).await;
    assert_eq!(source.calls.load(Ordering::SeqCst), 6);
    assert_eq!(queue.num_requeues(&id), 0);
    assert!(queue.is_empty());
    assert!(recorded.lock().is_empty());

    // The key is processed again once it is re-observed.
    source.objects.lock().insert(
        id.clone(),
        Fetch::Found(cluster_policy_object("require-labels")),
    );
    queue.add(id.clone());
    time::sleep(time::Duration::from_secs(1)).await;
    assert_eq!(recorded.lock().len(), 1);

    queue.shutdown();
    for worker in workers {
        worker.await.expect("worker must not panic");
    }
}

#[tokio::test(start_paused = true)]
async fn relist_requeues_previously_known_keys() {
    let tracker = SyncTracker::new([crate::POLICIES]);
    let sync = tracker.handle(crate::POLICIES).expect("kind must be tracked");
    let queue = Queue::<PolicyId>::shared();
    let (_signal, shutdown) = drain::channel();

    let events: Vec<watcher::Result<Event<DynamicObject>>> = vec![
        Ok(Event::Restarted(vec![policy_object("test", "a", "low")])),
        Ok(Event::Applied(policy_object("test", "b", "low"))),
        Ok(Event::Restarted(vec![policy_object("test", "c", "low")])),
    ];
    run_watch(
        Watch::from(stream::iter(events)),
        queue.clone(),
        sync,
        shutdown,
    )
    .await;

    assert!(tracker.is_synced());
    let mut queued = Vec::new();
    while !queue.is_empty() {
        let id = queue.get().await.expect("queue must not be shut down");
        queue.done(&id);
        queued.push(id.to_string());
    }
    queued.sort();
    assert_eq!(queued, vec!["test/a", "test/b", "test/c"]);
}

#[tokio::test(start_paused = true)]
async fn stream_errors_mark_kind_unsynced() {
    let tracker = SyncTracker::new([crate::POLICIES, crate::CLUSTER_POLICIES]);
    let sync = tracker.handle(crate::POLICIES).expect("kind must be tracked");
    let queue = Queue::<PolicyId>::shared();
    let (_signal, shutdown) = drain::channel();

    let events: Vec<watcher::Result<Event<DynamicObject>>> = vec![
        Ok(Event::Restarted(vec![])),
        Err(watcher::Error::WatchError(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version".to_string(),
            reason: "Expired".to_string(),
            code: 410,
        })),
    ];
    run_watch(
        Watch::from(stream::iter(events)),
        queue,
        sync,
        shutdown,
    )
    .await;

    assert_eq!(
        tracker.state(crate::POLICIES),
        Some(crate::SyncState::Unsynced)
    );
    assert!(!tracker.is_synced());
    assert!(tracker.is_healthy());
    assert_eq!(
        tracker.found_resources(),
        maplit::btreemap! {
            crate::CLUSTER_POLICIES.to_string() => false,
            crate::POLICIES.to_string() => true,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn failed_watch_relists_and_resyncs() {
    let tracker = SyncTracker::new([crate::POLICIES]);
    let sync = tracker.handle(crate::POLICIES).expect("kind must be tracked");
    let queue = Queue::<PolicyId>::shared();
    let (_signal, shutdown) = drain::channel();

    let builds = Arc::new(AtomicUsize::new(0));
    let b = builds.clone();
    let watch = Watch::restarting(move || {
        let events: Vec<watcher::Result<Event<DynamicObject>>> =
            match b.fetch_add(1, Ordering::SeqCst) {
                0 => vec![
                    Ok(Event::Restarted(vec![policy_object("test", "a", "low")])),
                    Err(watcher::Error::WatchError(kube::error::ErrorResponse {
                        status: "Failure".to_string(),
                        message: "etcdserver: leader changed".to_string(),
                        reason: "InternalError".to_string(),
                        code: 500,
                    })),
                ],
                _ => vec![Ok(Event::Restarted(vec![policy_object("test", "a", "low")]))],
            };
        stream::iter(events).chain(stream::pending())
    })
    .with_backoff(time::Duration::from_secs(2));
    let task = tokio::spawn(run_watch(watch, queue, sync, shutdown));

    time::sleep(time::Duration::from_secs(1)).await;
    assert_eq!(tracker.state(crate::POLICIES), Some(crate::SyncState::Unsynced));
    assert!(!tracker.is_synced());

    time::sleep(time::Duration::from_secs(60)).await;
    assert_eq!(builds.load(Ordering::SeqCst), 2);
    assert_eq!(tracker.state(crate::POLICIES), Some(crate::SyncState::Synced));
    assert!(tracker.is_synced());
    task.abort();
}

#[tokio::test]
async fn shutdown_stops_watch_and_queue() {
    let tracker = SyncTracker::new([crate::POLICIES]);
    let sync = tracker.handle(crate::POLICIES).expect("kind must be tracked");
    let queue = Queue::<PolicyId>::shared();
    let (signal, shutdown) = drain::channel();

    let task = tokio::spawn(run_watch(
        Watch::from(stream::pending::<watcher::Result<Event<DynamicObject>>>()),
        queue.clone(),
        sync,
        shutdown,
    ));
    tokio::task::yield_now().await;
    assert_eq!(tracker.state(crate::POLICIES), Some(crate::SyncState::Syncing));

    signal.drain().await;
    task.await.expect("watch must not panic");
    assert!(queue.is_shutdown());
}
