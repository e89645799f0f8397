use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Patch, PatchParams},
    Api, Client, ResourceExt,
};
use serde_json::json;

use crate::{
    consts,
    error::{LbError, LbResult},
};

/// Add the finalizer to the service, so the load balancer is torn down
/// before the service disappears.
pub async fn add(client: Client, svc: &Service) -> LbResult<()> {
    let api = Api::<Service>::namespaced(
        client,
        svc.namespace().ok_or(LbError::SkipService)?.as_str(),
    );
    let patch = json!({
        "metadata": {
            "finalizers": [consts::FINALIZER_NAME]
        }
    });
    api.patch(
        svc.name_any().as_str(),
        &PatchParams::default(),
        &Patch::Merge(patch),
    )
    .await?;
    Ok(())
}

/// Check if the service has the finalizer.
#[must_use]
pub fn check(service: &Service) -> bool {
    service
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.contains(&consts::FINALIZER_NAME.to_string()))
}

/// Remove the finalizer from the service, allowing its deletion to
/// complete.
///
/// If the service does not have the finalizer, this function does nothing.
pub async fn remove(client: Client, svc: &Service) -> LbResult<()> {
    let api = Api::<Service>::namespaced(
        client,
        svc.namespace().ok_or(LbError::SkipService)?.as_str(),
    );
    let finalizers = svc
        .finalizers()
        .iter()
        .filter(|item| item.as_str() != consts::FINALIZER_NAME)
        .collect::<Vec<_>>();
    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        svc.name_any().as_str(),
        &PatchParams::default(),
        &Patch::Merge(patch),
    )
    .await?;
    Ok(())
}
