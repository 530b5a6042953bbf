use chrono::{offset::Utc, DateTime};
use std::fmt;

/// Identifies a policy across both the namespaced and cluster-scoped kinds.
///
/// The identifier is derived from the resource's namespace and name, so it is
/// stable across updates of the same object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PolicyId {
    Namespaced { namespace: String, name: String },
    Cluster { name: String },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    Policy,
    ClusterPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Policy {
    pub kind: PolicyKind,
    pub api_version: String,
    pub id: PolicyId,
    pub uid: String,
    pub category: String,
    pub severity: String,
    pub description: String,
    pub autogen_controllers: Vec<String>,
    pub rules: Vec<Rule>,

    /// Unset when the policy spec does not configure background scans.
    pub background: Option<bool>,
    pub validation_failure_action: String,

    /// The policy rendered as YAML, without server-managed bookkeeping.
    pub content: String,
    pub creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    pub rule_type: RuleType,
    pub validate_message: String,
    pub verify_images: Vec<ImageVerification>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum RuleType {
    Validation,
    Mutation,
    Generation,
    #[default]
    Unclassified,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageVerification {
    pub repository: String,
    pub image: String,
    pub key: String,
    pub attestations: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LifecycleKind {
    Added,
    Updated,
    Deleted,
}

/// A policy transition as observed by the policy watcher.
#[derive(Clone, Debug, PartialEq)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub policy: Policy,

    /// The previously published snapshot, if one is known.
    pub old: Option<Policy>,
}

// === impl PolicyId ===

impl PolicyId {
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        match namespace {
            Some(namespace) if !namespace.is_empty() => Self::Namespaced { namespace, name },
            _ => Self::Cluster { name },
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Namespaced {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self::Cluster { name: name.into() }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Namespaced { name, .. } | Self::Cluster { name } => name,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Namespaced { namespace, .. } => Some(namespace),
            Self::Cluster { .. } => None,
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::Namespaced { .. } => PolicyKind::Policy,
            Self::Cluster { .. } => PolicyKind::ClusterPolicy,
        }
    }
}

/// Formats the identifier as a Kubernetes meta-namespace key.
impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespaced { namespace, name } => write!(f, "{namespace}/{name}"),
            Self::Cluster { name } => f.write_str(name),
        }
    }
}

// === impl PolicyKind ===

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Policy => "Policy",
            Self::ClusterPolicy => "ClusterPolicy",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Policy ===

impl Policy {
    /// Builds a policy that carries nothing but its identity.
    ///
    /// Used to describe resources that no longer exist.
    pub fn shell(id: PolicyId) -> Self {
        Self {
            kind: id.kind(),
            api_version: String::new(),
            id,
            uid: String::new(),
            category: String::new(),
            severity: String::new(),
            description: String::new(),
            autogen_controllers: Vec::new(),
            rules: Vec::new(),
            background: None,
            validation_failure_action: String::new(),
            content: String::new(),
            creation_timestamp: None,
        }
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.id.namespace()
    }

    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

// === impl RuleType ===

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Mutation => "mutation",
            Self::Generation => "generation",
            Self::Unclassified => "",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl LifecycleEvent ===

impl LifecycleEvent {
    pub fn added(policy: Policy) -> Self {
        Self {
            kind: LifecycleKind::Added,
            policy,
            old: None,
        }
    }

    pub fn updated(policy: Policy, old: Option<Policy>) -> Self {
        Self {
            kind: LifecycleKind::Updated,
            policy,
            old,
        }
    }

    pub fn deleted(policy: Policy, old: Option<Policy>) -> Self {
        Self {
            kind: LifecycleKind::Deleted,
            policy,
            old,
        }
    }
}
