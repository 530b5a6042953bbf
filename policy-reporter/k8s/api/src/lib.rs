#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod policy;
pub mod report;
mod watch;

pub use self::watch::{Event, Watch};
pub use k8s_openapi::{
    api::{
        self,
        coordination::v1::Lease,
        core::v1::{Event as CoreEvent, ObjectReference},
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
pub use kube::{
    api::{
        Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, ObjectMeta, Patch,
        PatchParams, PostParams, ResourceExt,
    },
    error::ErrorResponse,
    runtime::watcher,
    Client, Error, Resource,
};
