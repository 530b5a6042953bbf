#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod aggregator;
pub mod leader;
pub mod message;
pub mod violation;

pub use self::{
    aggregator::{AggregatorConfig, KubeReportStore, Report, ReportAggregator, ReportStore, Scope},
    leader::{ElectionParams, LeaderCallbacks, LeaderElector, LeaseClaims, ViolationPipeline},
    violation::{watch_events, ViolationWatcher},
};
pub use kyverno_policy_reporter_core as core;
pub use kyverno_policy_reporter_k8s_api as k8s;
