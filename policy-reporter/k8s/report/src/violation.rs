use crate::{
    core::{
        PolicyId, PolicyStore, PolicyViolation, ViolationEvent, ViolationPolicy,
        ViolationPublisher, ViolationResource,
    },
    k8s::{watcher, Api, CoreEvent, Event, ResourceExt, Watch},
    message,
};
use ahash::AHashMap as HashMap;
use chrono::{offset::Utc, DateTime};
use std::sync::Arc;
use tokio::{sync::mpsc, time};
use tracing::{debug, error, info_span, warn, Instrument};

/// Restricts the event watch to policy violations reported by Kyverno's
/// admission controller.
pub const FIELD_SELECTOR: &str = "source=kyverno-admission,reason=PolicyViolation,type=Warning";

const DISPATCH_CAPACITY: usize = 100;

/// Correlates blocked admission events with cached policies.
#[derive(Debug)]
pub struct ViolationWatcher {
    store: PolicyStore,
    start: DateTime<Utc>,

    /// The resource version last observed for each event, keyed by uid.
    seen: HashMap<String, String>,
}

/// Builds a restarting watch over violation events in `namespace`, or in all
/// namespaces.
pub fn watch_events(
    client: crate::k8s::Client,
    namespace: Option<&str>,
    backoff: time::Duration,
) -> Watch<CoreEvent> {
    let api = match namespace {
        Some(ns) => Api::<CoreEvent>::namespaced(client, ns),
        None => Api::<CoreEvent>::all(client),
    };
    let config = watcher::Config::default().fields(FIELD_SELECTOR);
    Watch::restarting(move || watcher::watcher(api.clone(), config.clone()))
        .instrument(info_span!("events"))
        .with_backoff(backoff)
}

// === impl ViolationWatcher ===

impl ViolationWatcher {
    /// Events created before `start`, or last touched before it, are ignored.
    pub fn new(store: PolicyStore, start: DateTime<Utc>) -> Self {
        Self {
            store,
            start,
            seen: HashMap::new(),
        }
    }

    /// Watches events until shutdown, publishing a violation for each blocked
    /// admission request.
    ///
    /// Violations are handed to a dispatch task so that slow listeners do not
    /// stall the watch. Returns once the dispatch task has published every
    /// pending violation.
    pub async fn run(
        mut self,
        mut events: Watch<CoreEvent>,
        publisher: Arc<ViolationPublisher>,
        shutdown: drain::Watch,
    ) {
        let (tx, rx) = mpsc::channel(DISPATCH_CAPACITY);
        let dispatch = tokio::spawn(dispatch(rx, publisher).in_current_span());

        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);
        loop {
            let ev = tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
                _ = &mut shutdown => {
                    debug!("Shutdown");
                    break;
                }
            };

            for violation in self.handle(ev) {
                if tx.send(violation).await.is_err() {
                    break;
                }
            }
        }

        drop(tx);
        if let Err(error) = dispatch.await {
            error!(%error, "Violation dispatch failed");
        }
    }

    fn handle(&mut self, ev: Event<CoreEvent>) -> Vec<PolicyViolation> {
        match ev {
            Event::Applied(event) => self.observe(&event).into_iter().collect(),
            Event::Deleted(event) => {
                if let Some(uid) = event.uid() {
                    self.seen.remove(&uid);
                }
                Vec::new()
            }
            Event::Restarted(events) => {
                let listed = events
                    .iter()
                    .filter_map(|e| e.uid())
                    .collect::<ahash::AHashSet<_>>();
                self.seen.retain(|uid, _| listed.contains(uid));
                events.iter().filter_map(|e| self.observe(e)).collect()
            }
        }
    }

    /// Classifies the event as an add or update and converts it, if it
    /// describes a blocked request made after startup.
    fn observe(&mut self, event: &CoreEvent) -> Option<PolicyViolation> {
        let uid = event.uid().unwrap_or_default();
        let version = event.resource_version().unwrap_or_default();
        let updated = match self.seen.insert(uid, version.clone()) {
            None => false,
            // A re-list replays objects that have not changed.
            Some(prior) if prior == version => return None,
            Some(_) => true,
        };

        let msg = event.message.as_deref().unwrap_or_default();
        if !message::is_blocked(msg) {
            return None;
        }

        let cutoff = if updated {
            event.last_timestamp.as_ref()
        } else {
            event.metadata.creation_timestamp.as_ref()
        };
        if cutoff.map_or(true, |t| t.0 < self.start) {
            return None;
        }

        self.convert(event, msg, updated)
    }

    fn convert(&self, event: &CoreEvent, msg: &str, updated: bool) -> Option<PolicyViolation> {
        let Some(blocked) = message::parse_message(msg) else {
            warn!(event = %event.name_any(), message = %msg, "Failed to parse violation message");
            return None;
        };

        let involved = &event.involved_object;
        let id = PolicyId::new(
            involved.namespace.clone(),
            involved.name.clone().unwrap_or_default(),
        );
        let Some(policy) = self.store.get(&id) else {
            error!(policy = %id, "Policy not found");
            return None;
        };

        let message = policy
            .rule(&blocked.rule)
            .map(|r| r.validate_message.as_str())
            .filter(|m| !m.is_empty())
            .unwrap_or(msg)
            .to_string();

        let timestamp = event
            .last_timestamp
            .as_ref()
            .or(event.metadata.creation_timestamp.as_ref())
            .map(|t| t.0)
            .unwrap_or(self.start);

        Some(PolicyViolation {
            resource: ViolationResource {
                kind: blocked.kind,
                namespace: blocked.namespace,
                name: blocked.name,
            },
            policy: ViolationPolicy {
                name: policy.name().to_string(),
                rule: blocked.rule,
                message,
                category: policy.category.clone(),
                severity: policy.severity.clone(),
            },
            event: ViolationEvent {
                name: event.name_any(),
                uid: event.uid().unwrap_or_default(),
            },
            timestamp,
            updated,
        })
    }
}

async fn dispatch(mut rx: mpsc::Receiver<PolicyViolation>, publisher: Arc<ViolationPublisher>) {
    while let Some(violation) = rx.recv().await {
        debug!(
            resource = %violation.resource.name,
            policy = %violation.policy.name,
            updated = violation.updated,
            "Publishing violation"
        );
        publisher.publish(violation).await;
    }
}
