#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use kyverno_policy_reporter_core as core;
pub use kyverno_policy_reporter_k8s_api as k8s;
pub use kyverno_policy_reporter_k8s_index as index;
pub use kyverno_policy_reporter_k8s_report as report;

mod args;
mod health;
mod lease;

pub use self::args::Args;
