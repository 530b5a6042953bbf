use chrono::{offset::Utc, DateTime};

/// Ties a single blocked admission request to the resource, the policy rule
/// and the event that reported it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyViolation {
    pub resource: ViolationResource,
    pub policy: ViolationPolicy,
    pub event: ViolationEvent,
    pub timestamp: DateTime<Utc>,

    /// Set when the originating event was updated after it was first seen,
    /// i.e. this violation supersedes one reported earlier for the same event.
    pub updated: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViolationResource {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViolationPolicy {
    pub name: String,
    pub rule: String,
    pub message: String,
    pub category: String,
    pub severity: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViolationEvent {
    pub name: String,
    pub uid: String,
}

impl ViolationResource {
    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }
}
