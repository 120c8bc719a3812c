//! AIMCache CRD types
//!
//! An `AIMCache` owns one PersistentVolumeClaim holding downloaded model
//! weights, tracks which models are cached there, and carries an optional
//! cleanup policy that evicts stale entries.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Default access mode for cache storage claims
pub const DEFAULT_ACCESS_MODE: &str = "ReadWriteOnce";

/// Default mount path for cache storage inside serving containers
pub const DEFAULT_CACHE_MOUNT_PATH: &str = "/workspace/model-cache";

/// Default maximum age of a cached model before cleanup evicts it
pub const DEFAULT_MAX_AGE: &str = "30d";

/// Storage-backed cache of model weights shared across endpoints
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "aim.engine.amd.com",
    version = "v1alpha1",
    kind = "AIMCache",
    plural = "aimcaches",
    shortname = "aimc",
    namespaced,
    status = "AIMCacheStatus",
    printcolumn = r#"{"name":"Size","type":"string","jsonPath":".spec.storage.size"}"#,
    printcolumn = r#"{"name":"Used","type":"string","jsonPath":".status.storage.usedSize"}"#,
    printcolumn = r#"{"name":"Models","type":"integer","jsonPath":".status.usage.totalModels"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AIMCacheSpec {
    /// Backing storage
    pub storage: CacheStorageSpec,

    /// Models expected to be cached
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<CacheModelSpec>,

    /// Cleanup policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupSpec>,
}

/// Backing storage for a cache
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStorageSpec {
    /// Requested size (Kubernetes quantity, e.g. "500Gi")
    pub size: String,

    /// Access mode for the claim (default ReadWriteOnce)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,

    /// Storage class; omitted means the cluster default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Mount path inside consuming containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
}

impl CacheStorageSpec {
    /// Access mode with the ReadWriteOnce default applied
    pub fn access_mode(&self) -> &str {
        self.access_mode.as_deref().unwrap_or(DEFAULT_ACCESS_MODE)
    }

    /// Mount path with the default applied
    pub fn mount_path(&self) -> &str {
        self.mount_path.as_deref().unwrap_or(DEFAULT_CACHE_MOUNT_PATH)
    }
}

/// A model expected in the cache
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheModelSpec {
    /// Model identifier
    pub id: String,

    /// Eviction priority: "low", "normal" (default) or "high"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,

    /// Retention override for age-based cleanup (e.g. "7d")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<String>,

    /// Expected on-disk size (quantity), used for space accounting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<String>,

    /// Whether the model should be fetched before first use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preload: Option<bool>,
}

/// Cleanup policy for a cache
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSpec {
    /// Whether cleanup runs at all
    #[serde(default)]
    pub enabled: bool,

    /// When cleanup runs: a cron expression ("0 2 * * *"), a shorthand such
    /// as "@daily", or a fixed interval like "12h"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Evict models not accessed for longer than this (default "30d")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<String>,

    /// Keep at least this much space available (quantity)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_free_space: Option<String>,

    /// Eviction order when reclaiming space: "lru" (default), "oldest", "largest"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Phase of an AIMCache
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CachePhase {
    /// Storage not yet provisioned
    #[default]
    Pending,
    /// Storage provisioned and inventory current
    Ready,
    /// Deletion requested but endpoints still use caching
    DeletionBlocked,
}

impl std::fmt::Display for CachePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Ready => write!(f, "Ready"),
            Self::DeletionBlocked => write!(f, "DeletionBlocked"),
        }
    }
}

/// Status of an AIMCache
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AIMCacheStatus {
    /// Current phase
    #[serde(default)]
    pub phase: CachePhase,

    /// Conditions explaining the phase
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation most recently reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Storage utilisation read from the claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageStatus>,

    /// Per-model inventory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cached_models: Vec<CachedModelStatus>,

    /// Aggregate usage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<CacheUsage>,
}

/// Storage utilisation figures
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    /// Requested capacity
    pub total_size: String,
    /// Space held by cached models
    pub used_size: String,
    /// Capacity minus used
    pub available_size: String,
    /// used / total * 100
    pub usage_percentage: f64,
    /// Name of the backing claim
    pub pvc_name: String,
    /// Claim phase (Pending, Bound, Lost)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_phase: Option<String>,
}

/// Lifecycle state of one cached model
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CachedModelState {
    /// Declared but never used by an endpoint
    #[default]
    Pending,
    /// Held in the cache
    Cached,
    /// Removed by cleanup
    Evicted,
}

/// Inventory entry for one model
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CachedModelStatus {
    /// Model identifier
    pub id: String,
    /// On-disk size (quantity)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// First time the model was observed in use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
    /// Most recent time the model was observed in use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
    /// Number of caching endpoints currently serving the model
    #[serde(default)]
    pub access_count: i64,
    /// Entry state
    #[serde(default)]
    pub status: CachedModelState,
}

/// Aggregate cache usage
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheUsage {
    /// Number of inventory entries
    pub total_models: i32,
    /// Entries accessed within the last 24 hours
    pub active_models: i32,
    /// When cleanup last ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cleanup: Option<DateTime<Utc>>,
    /// When cleanup runs next
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cleanup: Option<DateTime<Utc>>,
}

/// Name of the claim backing a cache
pub fn cache_pvc_name(cache_name: &str) -> String {
    format!("{cache_name}-storage")
}
