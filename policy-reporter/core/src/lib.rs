#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod policy;
pub mod publisher;
pub mod store;
pub mod violation;

pub use self::{
    policy::{
        ImageVerification, LifecycleEvent, LifecycleKind, Policy, PolicyId, PolicyKind, Rule,
        RuleType,
    },
    publisher::{Listener, Publisher},
    store::PolicyStore,
    violation::{PolicyViolation, ViolationEvent, ViolationPolicy, ViolationResource},
};

/// Publishes policy lifecycle transitions to the cache and metrics listeners.
pub type LifecyclePublisher = Publisher<LifecycleEvent>;

/// Publishes correlated violations to the report aggregator.
pub type ViolationPublisher = Publisher<PolicyViolation>;
