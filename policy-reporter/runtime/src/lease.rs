use crate::k8s::{self, Api, Lease, ObjectMeta, Patch, PatchParams};
use anyhow::Result;
use kubert::lease::LeaseManager;

const FIELD_MANAGER: &str = "kyverno-policy-reporter";

/// Ensures the named Lease exists and returns a manager contending for it.
pub async fn init(client: k8s::Client, ns: &str, name: &str) -> Result<LeaseManager> {
    let lease = Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(ns.to_string()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            labels: Some(
                [(
                    "app.kubernetes.io/managed-by".to_string(),
                    FIELD_MANAGER.to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = Api::<Lease>::namespaced(client, ns);
    match api
        .patch(
            name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => {
            return Err(error.into());
        }
    };

    let manager = LeaseManager::init(api, name).await?;
    Ok(manager)
}
