//! Kyverno policy resources.
//!
//! Policies are watched as untyped objects so that fields added by newer
//! Kyverno releases never fail deserialization.

use kube::api::{ApiResource, GroupVersionKind};

pub const GROUP: &str = "kyverno.io";
pub const VERSION: &str = "v1";

pub fn policies() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(GROUP, VERSION, "Policy"),
        "policies",
    )
}

pub fn cluster_policies() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(GROUP, VERSION, "ClusterPolicy"),
        "clusterpolicies",
    )
}
