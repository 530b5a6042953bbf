use crate::core::{LifecycleEvent, LifecycleKind, Listener, Policy, PolicyId, Rule};
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{family::Family, gauge::Gauge},
    registry::Registry,
};

/// Exposes one `kyverno_policy` series per rule of every known policy.
///
/// The label sets last exported for each policy are remembered so that stale
/// series can be removed when a policy changes or disappears.
#[derive(Debug)]
pub struct PolicyMetrics {
    policies: Family<PolicyLabels, Gauge>,
    exported: Mutex<HashMap<PolicyId, Vec<PolicyLabels>>>,
}

/// Label names match the series existing dashboards query.
#[allow(non_snake_case)]
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PolicyLabels {
    namespace: String,
    kind: String,
    policy: String,
    rule: String,
    r#type: String,
    background: String,
    severity: String,
    category: String,
    validationFailureAction: String,
}

// === impl PolicyMetrics ===

impl PolicyMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let policies = Family::default();
        prom.register("kyverno_policy", "List of all Policies", policies.clone());
        Self {
            policies,
            exported: Mutex::new(HashMap::new()),
        }
    }

    fn apply(&self, policy: &Policy) {
        let mut exported = self.exported.lock();
        if let Some(stale) = exported.remove(&policy.id) {
            for labels in &stale {
                self.policies.remove(labels);
            }
        }

        let labels = policy
            .rules
            .iter()
            .map(|rule| PolicyLabels::new(policy, rule))
            .collect::<Vec<_>>();
        for labels in &labels {
            self.policies.get_or_create(labels).set(1);
        }
        exported.insert(policy.id.clone(), labels);
    }

    fn remove(&self, id: &PolicyId) {
        if let Some(stale) = self.exported.lock().remove(id) {
            for labels in &stale {
                self.policies.remove(labels);
            }
        }
    }
}

#[async_trait::async_trait]
impl Listener<LifecycleEvent> for PolicyMetrics {
    async fn on_event(&self, event: &LifecycleEvent) {
        match event.kind {
            LifecycleKind::Added | LifecycleKind::Updated => self.apply(&event.policy),
            LifecycleKind::Deleted => self.remove(&event.policy.id),
        }
    }
}

// === impl PolicyLabels ===

impl PolicyLabels {
    fn new(policy: &Policy, rule: &Rule) -> Self {
        Self {
            namespace: policy.namespace().unwrap_or_default().to_string(),
            kind: policy.kind.to_string(),
            policy: policy.name().to_string(),
            rule: rule.name.clone(),
            r#type: rule.rule_type.to_string(),
            background: policy
                .background
                .map(|b| b.to_string())
                .unwrap_or_default(),
            severity: policy.severity.clone(),
            category: policy.category.clone(),
            validationFailureAction: policy.validation_failure_action.clone(),
        }
    }
}
