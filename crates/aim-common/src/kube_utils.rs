//! Shared Kubernetes utilities for the AIM controllers
//!
//! Finalizer bookkeeping, status patching, owner references and the standard
//! label set carried by every generated object.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    Error, LABEL_COMPONENT, LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_MANAGED_BY_AIM, LABEL_NAME,
};

// =============================================================================
// Labels and ownership
// =============================================================================

/// Standard identification labels for a generated object.
///
/// `name` identifies the owning kind (`aim-endpoint`, `aim-cache`), `instance`
/// the owning resource and `component` the object's role.
pub fn standard_labels(name: &str, instance: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), name.to_string()),
        (LABEL_INSTANCE.to_string(), instance.to_string()),
        (LABEL_COMPONENT.to_string(), component.to_string()),
        (LABEL_MANAGED_BY.to_string(), LABEL_MANAGED_BY_AIM.to_string()),
    ])
}

/// Selector labels: the stable subset of [`standard_labels`] used to match pods
pub fn selector_labels(name: &str, instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), name.to_string()),
        (LABEL_INSTANCE.to_string(), instance.to_string()),
    ])
}

/// Controller owner reference pointing at `owner`.
///
/// Children carrying it are garbage-collected by Kubernetes when the owner is
/// deleted. Fails if the owner has not been persisted yet (no UID).
pub fn controller_owner_ref<K>(owner: &K) -> Result<OwnerReference, Error>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "owner_reference",
            format!("{} {} has no UID", K::kind(&()), owner.name_any()),
        )
    })
}

// =============================================================================
// Finalizers
// =============================================================================

/// Returns true if the object carries the given finalizer
pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == finalizer))
}

/// Returns true if deletion of the object has been requested
pub fn is_being_deleted<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Add a finalizer to a namespaced resource (no-op if already present)
pub async fn add_finalizer<K>(
    client: &Client,
    name: &str,
    namespace: &str,
    finalizer: &str,
    field_manager: &str,
) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);

    let obj = api.get(name).await?;
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;

    debug!(resource = %name, %finalizer, "Added finalizer");
    Ok(())
}

/// Remove a finalizer from a namespaced resource (no-op if absent or gone)
pub async fn remove_finalizer<K>(
    client: &Client,
    name: &str,
    namespace: &str,
    finalizer: &str,
    field_manager: &str,
) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);

    let Some(obj) = api.get_opt(name).await? else {
        return Ok(());
    };
    let finalizers: Vec<String> = obj
        .meta()
        .finalizers
        .as_ref()
        .map(|f| f.iter().filter(|s| *s != finalizer).cloned().collect())
        .unwrap_or_default();

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;

    debug!(resource = %name, %finalizer, "Removed finalizer");
    Ok(())
}

// =============================================================================
// Status
// =============================================================================

/// Patch the status sub-resource of a namespaced resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch.
pub async fn patch_resource_status<K>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Server-side apply a typed namespaced object, forcing field ownership
pub async fn apply_namespaced<K>(
    client: &Client,
    obj: &K,
    field_manager: &str,
) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + serde::Serialize
        + std::fmt::Debug,
{
    let name = obj.meta().name.clone().ok_or_else(|| {
        Error::internal_with_context("apply", format!("{} without a name", K::kind(&())))
    })?;
    let namespace = obj.meta().namespace.clone().ok_or_else(|| {
        Error::internal_with_context(
            "apply",
            format!("{} {} without a namespace", K::kind(&()), name),
        )
    })?;

    let api: Api<K> = Api::namespaced(client.clone(), &namespace);
    api.patch(
        &name,
        &PatchParams::apply(field_manager).force(),
        &Patch::Apply(obj),
    )
    .await?;

    debug!(kind = %K::kind(&()), %name, %namespace, "Applied via SSA");
    Ok(())
}
