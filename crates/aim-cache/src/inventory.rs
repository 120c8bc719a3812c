//! Cached-model inventory and storage accounting
//!
//! The inventory has one entry per model declared in `spec.models`. Entries
//! carry forward across reconciles; access tracking is derived from the
//! caching endpoints in the cache's namespace that serve each model.

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tracing::debug;

use aim_common::crd::{
    AIMCacheSpec, CacheUsage, CachedModelState, CachedModelStatus, StorageStatus,
};
use aim_common::quantity::{format_bytes, parse_quantity_bytes};
use aim_common::usage::UsageIndex;
use aim_common::Error;

/// Hours within which a model counts as active
pub const ACTIVE_WINDOW_HOURS: i64 = 24;

/// Minimum hours between `lastAccessed` refreshes of a model that stays in use.
///
/// Refreshing on every reconcile would make each status write differ from
/// the last and retrigger the controller.
pub const ACCESS_REFRESH_HOURS: i64 = 1;

/// Rebuild the inventory from the declared models and the previous status.
///
/// A model is in use when at least one caching endpoint in `namespace` serves
/// it. Models no longer declared drop out.
pub fn reconcile_inventory(
    spec: &AIMCacheSpec,
    previous: &[CachedModelStatus],
    namespace: &str,
    index: &UsageIndex,
    now: DateTime<Utc>,
) -> Vec<CachedModelStatus> {
    spec.models
        .iter()
        .map(|model| {
            let mut entry = previous
                .iter()
                .find(|e| e.id == model.id)
                .cloned()
                .unwrap_or_else(|| CachedModelStatus {
                    id: model.id.clone(),
                    ..Default::default()
                });
            if model.max_size.is_some() {
                entry.size = model.max_size.clone();
            }

            let users = index.cached_model_users(namespace, &model.id) as i64;
            if users > 0 {
                record_access(&mut entry, users, now);
            } else {
                entry.access_count = 0;
            }
            entry
        })
        .collect()
}

fn record_access(entry: &mut CachedModelStatus, users: i64, now: DateTime<Utc>) {
    let newly_used = entry.access_count == 0 || entry.status != CachedModelState::Cached;
    let stale = entry
        .last_accessed
        .map_or(true, |t| now - t >= Duration::hours(ACCESS_REFRESH_HOURS));

    if entry.status != CachedModelState::Cached {
        debug!(model = %entry.id, "Model entered cache");
        entry.cached_at = Some(now);
        entry.status = CachedModelState::Cached;
    }
    if newly_used || stale {
        entry.last_accessed = Some(now);
    }
    entry.access_count = users;
}

/// Aggregate usage over the inventory, carrying cleanup timestamps forward
pub fn cache_usage(
    entries: &[CachedModelStatus],
    previous: Option<&CacheUsage>,
    now: DateTime<Utc>,
) -> CacheUsage {
    let window = Duration::hours(ACTIVE_WINDOW_HOURS);
    let active = entries
        .iter()
        .filter(|e| e.last_accessed.is_some_and(|t| now - t < window))
        .count();
    CacheUsage {
        total_models: entries.len() as i32,
        active_models: active as i32,
        last_cleanup: previous.and_then(|u| u.last_cleanup),
        next_cleanup: previous.and_then(|u| u.next_cleanup),
    }
}

/// Size of an entry in bytes; unknown or unparseable sizes count as zero
pub fn entry_size_bytes(entry: &CachedModelStatus) -> u64 {
    entry
        .size
        .as_deref()
        .and_then(|s| match parse_quantity_bytes(s) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(model = %entry.id, error = %e, "Ignoring unparseable model size");
                None
            }
        })
        .unwrap_or(0)
}

/// Bytes held by entries currently in the cache
pub fn used_bytes(entries: &[CachedModelStatus]) -> u64 {
    entries
        .iter()
        .filter(|e| e.status == CachedModelState::Cached)
        .map(entry_size_bytes)
        .sum()
}

/// Storage figures for the claim backing a cache.
///
/// Returns `None` when the claim does not exist.
pub fn storage_status(
    spec: &AIMCacheSpec,
    pvc: Option<&PersistentVolumeClaim>,
    entries: &[CachedModelStatus],
) -> Result<Option<StorageStatus>, Error> {
    let Some(pvc) = pvc else {
        return Ok(None);
    };

    let total = parse_quantity_bytes(&spec.storage.size)?;
    let used = used_bytes(entries);
    let available = total.saturating_sub(used);
    let usage_percentage = if total == 0 {
        0.0
    } else {
        ((used as f64 / total as f64) * 1000.0).round() / 10.0
    };

    Ok(Some(StorageStatus {
        total_size: spec.storage.size.clone(),
        used_size: format_bytes(used),
        available_size: format_bytes(available),
        usage_percentage,
        pvc_name: pvc.metadata.name.clone().unwrap_or_default(),
        pvc_phase: pvc.status.as_ref().and_then(|s| s.phase.clone()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_common::crd::{AIMEndpoint, AIMEndpointSpec, CacheModelSpec, CacheStorageSpec};
    use k8s_openapi::api::core::v1::PersistentVolumeClaimStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn spec(models: &[(&str, Option<&str>)]) -> AIMCacheSpec {
        AIMCacheSpec {
            storage: CacheStorageSpec {
                size: "100Gi".to_string(),
                ..Default::default()
            },
            models: models
                .iter()
                .map(|(id, size)| CacheModelSpec {
                    id: id.to_string(),
                    max_size: size.map(str::to_string),
                    ..Default::default()
                })
                .collect(),
            cleanup: None,
        }
    }

    fn caching_endpoint(ns: &str, name: &str, model: &str) -> AIMEndpoint {
        let spec: AIMEndpointSpec = serde_json::from_value(serde_json::json!({
            "model": {"id": model},
            "cache": {"enabled": true}
        }))
        .unwrap();
        let mut ep = AIMEndpoint::new(name, spec);
        ep.metadata.namespace = Some(ns.to_string());
        ep
    }

    fn bound_pvc() -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("shared-storage".to_string()),
                ..Default::default()
            },
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn unused_models_are_pending() {
        let inv = reconcile_inventory(
            &spec(&[("org/a", None)]),
            &[],
            "ml",
            &UsageIndex::default(),
            Utc::now(),
        );
        assert_eq!(inv.len(), 1);
        assert_eq!(inv[0].status, CachedModelState::Pending);
        assert_eq!(inv[0].access_count, 0);
        assert!(inv[0].cached_at.is_none());
    }

    #[test]
    fn model_in_use_in_same_namespace_is_cached() {
        let now = Utc::now();
        let eps = vec![
            caching_endpoint("ml", "e1", "org/a"),
            caching_endpoint("ml", "e2", "org/a"),
            caching_endpoint("other", "e3", "org/a"),
        ];
        let inv = reconcile_inventory(
            &spec(&[("org/a", Some("15Gi"))]),
            &[],
            "ml",
            &UsageIndex::build(&eps),
            now,
        );
        assert_eq!(inv[0].status, CachedModelState::Cached);
        assert_eq!(inv[0].access_count, 2);
        assert_eq!(inv[0].cached_at, Some(now));
        assert_eq!(inv[0].last_accessed, Some(now));
        assert_eq!(inv[0].size.as_deref(), Some("15Gi"));
    }

    #[test]
    fn last_accessed_refresh_is_throttled() {
        let now = Utc::now();
        let eps = vec![caching_endpoint("ml", "e1", "org/a")];
        let index = UsageIndex::build(&eps);
        let recent = CachedModelStatus {
            id: "org/a".to_string(),
            cached_at: Some(now - Duration::days(2)),
            last_accessed: Some(now - Duration::minutes(10)),
            access_count: 1,
            status: CachedModelState::Cached,
            ..Default::default()
        };

        let inv = reconcile_inventory(
            &spec(&[("org/a", None)]),
            std::slice::from_ref(&recent),
            "ml",
            &index,
            now,
        );
        assert_eq!(inv[0], recent, "entry in steady use must not change");

        let mut old = recent.clone();
        old.last_accessed = Some(now - Duration::hours(2));
        let inv = reconcile_inventory(&spec(&[("org/a", None)]), &[old], "ml", &index, now);
        assert_eq!(inv[0].last_accessed, Some(now));
        assert_eq!(inv[0].cached_at, recent.cached_at);
    }

    #[test]
    fn evicted_model_put_back_in_use_is_recached() {
        let now = Utc::now();
        let eps = vec![caching_endpoint("ml", "e1", "org/a")];
        let evicted = CachedModelStatus {
            id: "org/a".to_string(),
            cached_at: Some(now - Duration::days(40)),
            last_accessed: Some(now - Duration::days(35)),
            status: CachedModelState::Evicted,
            ..Default::default()
        };
        let inv = reconcile_inventory(
            &spec(&[("org/a", None)]),
            &[evicted],
            "ml",
            &UsageIndex::build(&eps),
            now,
        );
        assert_eq!(inv[0].status, CachedModelState::Cached);
        assert_eq!(inv[0].cached_at, Some(now));
    }

    #[test]
    fn undeclared_models_drop_out() {
        let previous = vec![CachedModelStatus {
            id: "org/removed".to_string(),
            status: CachedModelState::Cached,
            ..Default::default()
        }];
        let inv = reconcile_inventory(
            &spec(&[("org/a", None)]),
            &previous,
            "ml",
            &UsageIndex::default(),
            Utc::now(),
        );
        assert_eq!(inv.len(), 1);
        assert_eq!(inv[0].id, "org/a");
    }

    #[test]
    fn active_models_counted_within_a_day() {
        let now = Utc::now();
        let entries = vec![
            CachedModelStatus {
                id: "a".into(),
                last_accessed: Some(now - Duration::hours(1)),
                ..Default::default()
            },
            CachedModelStatus {
                id: "b".into(),
                last_accessed: Some(now - Duration::hours(30)),
                ..Default::default()
            },
            CachedModelStatus {
                id: "c".into(),
                ..Default::default()
            },
        ];
        let usage = cache_usage(&entries, None, now);
        assert_eq!(usage.total_models, 3);
        assert_eq!(usage.active_models, 1);
    }

    #[test]
    fn storage_counts_only_cached_entries() {
        let entries = vec![
            CachedModelStatus {
                id: "a".into(),
                size: Some("20Gi".into()),
                status: CachedModelState::Cached,
                ..Default::default()
            },
            CachedModelStatus {
                id: "b".into(),
                size: Some("30Gi".into()),
                status: CachedModelState::Evicted,
                ..Default::default()
            },
            CachedModelStatus {
                id: "c".into(),
                size: Some("5Gi".into()),
                status: CachedModelState::Pending,
                ..Default::default()
            },
        ];
        let status = storage_status(&spec(&[]), Some(&bound_pvc()), &entries)
            .unwrap()
            .unwrap();
        assert_eq!(status.total_size, "100Gi");
        assert_eq!(status.used_size, "20Gi");
        assert_eq!(status.available_size, "80Gi");
        assert_eq!(status.usage_percentage, 20.0);
        assert_eq!(status.pvc_name, "shared-storage");
        assert_eq!(status.pvc_phase.as_deref(), Some("Bound"));
    }

    #[test]
    fn storage_is_cleared_without_a_claim() {
        assert!(storage_status(&spec(&[]), None, &[]).unwrap().is_none());
    }

    #[test]
    fn empty_cache_reports_zero_usage() {
        let status = storage_status(&spec(&[]), Some(&bound_pvc()), &[])
            .unwrap()
            .unwrap();
        assert_eq!(status.used_size, "0");
        assert_eq!(status.usage_percentage, 0.0);
    }
}
