//! PersistentVolumeClaim backing an AIMCache
//!
//! Most of a claim's spec is immutable once created. The controller creates
//! the full object when absent and afterwards only touches the fields
//! Kubernetes lets it change: labels, owner references and requested size
//! (grow only).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use aim_common::crd::{cache_pvc_name, AIMCache};
use aim_common::kube_utils::{controller_owner_ref, standard_labels};
use aim_common::quantity::parse_quantity_bytes;
use aim_common::Error;

/// `app.kubernetes.io/name` of objects owned by caches
pub const CACHE_APP_NAME: &str = "aim-cache";

/// `app.kubernetes.io/component` of the cache claim
pub const STORAGE_COMPONENT: &str = "storage";

/// Build the desired claim for a cache
pub fn build_cache_pvc(cache: &AIMCache) -> Result<PersistentVolumeClaim, Error> {
    let name = cache.name_any();
    let namespace = cache
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "AIMCache must be namespaced"))?;
    let storage = &cache.spec.storage;

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(cache_pvc_name(&name)),
            namespace: Some(namespace),
            labels: Some(standard_labels(CACHE_APP_NAME, &name, STORAGE_COMPONENT)),
            owner_references: Some(vec![controller_owner_ref(cache)?]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![storage.access_mode().to_string()]),
            storage_class_name: storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Requested storage of a claim, if any
pub fn requested_storage(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .map(|q| q.0.as_str())
}

fn storage_bytes(pvc: &PersistentVolumeClaim) -> Option<u64> {
    requested_storage(pvc).and_then(|q| parse_quantity_bytes(q).ok())
}

/// Whether the desired claim asks for less storage than the existing one.
///
/// Kubernetes only allows claims to grow, so a shrink is never applied.
pub fn is_shrink(existing: &PersistentVolumeClaim, desired: &PersistentVolumeClaim) -> bool {
    matches!(
        (storage_bytes(existing), storage_bytes(desired)),
        (Some(have), Some(want)) if want < have
    )
}

/// Whether the existing claim's mutable fields differ from the desired claim
pub fn needs_update(existing: &PersistentVolumeClaim, desired: &PersistentVolumeClaim) -> bool {
    let labels_current = desired
        .labels()
        .iter()
        .all(|(k, v)| existing.labels().get(k) == Some(v));
    let owner_current = desired
        .owner_references()
        .iter()
        .all(|want| existing.owner_references().iter().any(|o| o.uid == want.uid));
    let size_current = match (requested_storage(existing), requested_storage(desired)) {
        (Some(have), Some(want)) => {
            match (parse_quantity_bytes(have), parse_quantity_bytes(want)) {
                (Ok(have_bytes), Ok(want_bytes)) => have_bytes >= want_bytes,
                _ => have == want,
            }
        }
        (None, None) => true,
        _ => false,
    };
    !(labels_current && owner_current && size_current)
}

/// Merge patch carrying only the mutable fields of the desired claim.
///
/// The requested size never drops below what the existing claim holds.
pub fn mutable_fields_patch(
    existing: &PersistentVolumeClaim,
    desired: &PersistentVolumeClaim,
) -> serde_json::Value {
    let storage = if is_shrink(existing, desired) {
        requested_storage(existing)
    } else {
        requested_storage(desired)
    };
    serde_json::json!({
        "metadata": {
            "labels": desired.labels(),
            "ownerReferences": desired.owner_references(),
        },
        "spec": {
            "resources": {
                "requests": {
                    "storage": storage,
                }
            }
        }
    })
}
