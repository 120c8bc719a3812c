//! AIMEndpoint CRD types
//!
//! An `AIMEndpoint` is the user-facing request: "serve model X". The endpoint
//! controller resolves a recipe for it, materialises the serving workload and
//! publishes reachable addresses and replica counts back onto its status.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// Default cache claim size when caching is enabled without a size
pub const DEFAULT_ENDPOINT_CACHE_SIZE: &str = "100Gi";

/// Model inference endpoint
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "aim.engine.amd.com",
    version = "v1alpha1",
    kind = "AIMEndpoint",
    plural = "aimendpoints",
    shortname = "aime",
    namespaced,
    status = "AIMEndpointStatus",
    printcolumn = r#"{"name":"Model","type":"string","jsonPath":".spec.model.id"}"#,
    printcolumn = r#"{"name":"Recipe","type":"string","jsonPath":".status.selectedRecipe.name"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.replicas.ready"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AIMEndpointSpec {
    /// Model to serve
    pub model: ModelRef,

    /// How the recipe is chosen
    #[serde(default)]
    pub recipe: RecipeSelectionSpec,

    /// Resource requests and limits
    #[serde(default)]
    pub resources: EndpointResources,

    /// Replica bounds and autoscaling targets
    #[serde(default)]
    pub scaling: ScalingSpec,

    /// Service exposure
    #[serde(default)]
    pub service: ServiceExposure,

    /// Monitoring integration
    #[serde(default)]
    pub monitoring: MonitoringSpec,

    /// Model cache volume
    #[serde(default)]
    pub cache: EndpointCacheSpec,

    /// Pod identity and security context
    #[serde(default)]
    pub security: SecuritySpec,

    /// Rollout settings
    #[serde(default)]
    pub deployment: DeploymentSettings,

    /// Serving image override
    #[serde(default)]
    pub image: ImageSpec,
}

/// Model identity
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    /// Model identifier (matched against `AIMRecipe.spec.modelId`)
    pub id: String,
    /// Model version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Model revision (branch, tag or commit)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// Recipe selection mode
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecipeSelectionSpec {
    /// Pick a recipe automatically from those matching the model id
    #[serde(default)]
    pub auto_select: bool,

    /// Requested GPU count when `resources.gpuCount` is unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<i32>,

    /// Only consider recipes with this precision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<String>,

    /// Only consider recipes with this backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    /// Pin a specific recipe by name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_recipe: Option<CustomRecipeRef>,
}

/// Reference to a named recipe
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomRecipeRef {
    /// Recipe name
    pub name: String,
    /// Recipe namespace; defaults to the endpoint's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Resource requests and limits for the serving container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointResources {
    /// GPUs requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<i32>,
    /// CPU request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// CPU limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    /// Memory limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// Replica bounds and autoscaling targets
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalingSpec {
    /// Minimum (and initial) replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    /// Maximum replica count; autoscaling is enabled when greater than 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    /// Target average CPU utilisation (percent)
    #[serde(
        rename = "targetCPUUtilization",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_cpu_utilization: Option<i32>,
    /// Target average memory utilisation (percent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_memory_utilization: Option<i32>,
    /// Scale-up stabilisation window in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_delay: Option<i32>,
    /// Scale-down stabilisation window in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_delay: Option<i32>,
}

/// Service exposure
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExposure {
    /// Service type (ClusterIP, NodePort, LoadBalancer)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Service port (default 8000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Annotations copied verbatim onto the Service
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Requested load balancer IP
    #[serde(
        rename = "loadBalancerIP",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub load_balancer_ip: Option<String>,
}

/// Monitoring integration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSpec {
    /// Emit monitoring objects for this endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Prometheus scrape settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusSpec>,
}

/// Prometheus scrape settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusSpec {
    /// Scrape enabled (default true when monitoring is enabled)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Scrape interval (default "30s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Metrics path (default "/metrics")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Per-endpoint model cache volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointCacheSpec {
    /// Mount a cache volume into the serving container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Claim size (default "100Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Storage class; omitted means the cluster default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// Access mode (default ReadWriteOnce)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,
}

/// Pod identity and security context
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySpec {
    /// Existing service account for the serving pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Pod-level security context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_security_context: Option<PodSecurity>,
}

/// Subset of the pod security context exposed on endpoints
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodSecurity {
    /// UID to run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    /// GID to run as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_group: Option<i64>,
    /// Group owning mounted volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<i64>,
}

/// Rollout settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSettings {
    /// Deployment strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategySpec>,
}

/// Deployment strategy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StrategySpec {
    /// "RollingUpdate" (default) or "Recreate"
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Rolling update parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateSpec>,
}

/// Rolling update parameters (absolute pod counts)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateSpec {
    /// Pods allowed above the desired count during rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<i32>,
    /// Pods allowed unavailable during rollout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,
}

/// Serving image override
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Image repository; when unset the backend's conventional image is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Image tag (default "latest")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Image pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
    /// Names of image pull secrets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pull_secrets: Vec<String>,
}

impl AIMEndpointSpec {
    /// GPU count the endpoint asks for: resources first, then recipe, then 1
    pub fn requested_gpu_count(&self) -> i32 {
        self.resources
            .gpu_count
            .or(self.recipe.gpu_count)
            .unwrap_or(1)
    }

    /// Whether a cache volume is mounted
    pub fn cache_enabled(&self) -> bool {
        self.cache.enabled.unwrap_or(false)
    }

    /// Whether monitoring objects are emitted
    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.enabled.unwrap_or(false)
    }

    /// Initial replica count (scaling minimum, default 1)
    pub fn min_replicas(&self) -> i32 {
        self.scaling.min_replicas.unwrap_or(1)
    }

    /// Autoscaling applies only when the maximum exceeds one replica
    pub fn autoscaling_enabled(&self) -> bool {
        self.scaling.max_replicas.is_some_and(|max| max > 1)
    }

    /// Cache claim size with the default applied
    pub fn cache_size(&self) -> &str {
        self.cache
            .size
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT_CACHE_SIZE)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Phase of an AIMEndpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum EndpointPhase {
    /// Workload exists but no replica is ready
    #[default]
    Pending,
    /// Controller is converging the endpoint
    Reconciling,
    /// At least one replica is serving
    Ready,
    /// Recipe selection failed
    Failed,
}

impl std::fmt::Display for EndpointPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Reconciling => write!(f, "Reconciling"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status of an AIMEndpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AIMEndpointStatus {
    /// Current phase; absent until the first reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<EndpointPhase>,

    /// Conditions explaining the phase
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation most recently reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Resolved recipe snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_recipe: Option<SelectedRecipe>,

    /// Replica counts read back from the Deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<ReplicaCounts>,

    /// Reachable addresses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<EndpointAddresses>,
}

/// Recipe snapshot resolved for an endpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectedRecipe {
    /// Recipe name
    pub name: String,
    /// Recipe namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// GPUs from the matched configuration (unset for pinned recipes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<i32>,
    /// Precision
    pub precision: String,
    /// Backend
    pub backend: String,
}

/// Replica counts
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaCounts {
    /// Replicas created
    pub current: i32,
    /// Replicas requested
    pub desired: i32,
    /// Replicas passing readiness
    pub ready: i32,
    /// Replicas available
    pub available: i32,
}

/// Reachable addresses
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAddresses {
    /// In-cluster DNS address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<String>,
    /// Externally reachable address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
    /// Load balancer ingress point
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_spec(model: &str) -> AIMEndpointSpec {
        serde_json::from_value(serde_json::json!({"model": {"id": model}})).unwrap()
    }

    #[test]
    fn minimal_spec_fills_defaults() {
        let spec = make_spec("org/model-7b");
        assert_eq!(spec.requested_gpu_count(), 1);
        assert_eq!(spec.min_replicas(), 1);
        assert!(!spec.cache_enabled());
        assert!(!spec.monitoring_enabled());
        assert!(!spec.autoscaling_enabled());
        assert!(!spec.recipe.auto_select);
    }

    #[test]
    fn resources_gpu_count_wins_over_recipe_hint() {
        let mut spec = make_spec("m");
        spec.recipe.gpu_count = Some(2);
        assert_eq!(spec.requested_gpu_count(), 2);
        spec.resources.gpu_count = Some(4);
        assert_eq!(spec.requested_gpu_count(), 4);
    }

    #[test]
    fn autoscaling_needs_more_than_one_replica() {
        let mut spec = make_spec("m");
        spec.scaling.max_replicas = Some(1);
        assert!(!spec.autoscaling_enabled());
        spec.scaling.max_replicas = Some(5);
        assert!(spec.autoscaling_enabled());
    }

    #[test]
    fn wire_names_match_published_schema() {
        let json = serde_json::json!({
            "model": {"id": "org/model-7b"},
            "scaling": {
                "maxReplicas": 5,
                "targetCPUUtilization": 70,
                "targetMemoryUtilization": 80
            },
            "service": {"type": "LoadBalancer", "loadBalancerIP": "10.0.0.5"},
            "cache": {"enabled": true, "size": "200Gi"}
        });
        let spec: AIMEndpointSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.scaling.target_cpu_utilization, Some(70));
        assert_eq!(spec.scaling.target_memory_utilization, Some(80));
        assert_eq!(spec.service.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(spec.service.load_balancer_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(spec.cache_size(), "200Gi");
    }

    #[test]
    fn cache_size_default() {
        let mut spec = make_spec("m");
        spec.cache.enabled = Some(true);
        assert_eq!(spec.cache_size(), "100Gi");
    }

    #[test]
    fn status_serializes_selected_recipe() {
        let status = AIMEndpointStatus {
            phase: Some(EndpointPhase::Ready),
            selected_recipe: Some(SelectedRecipe {
                name: "t1".to_string(),
                namespace: None,
                gpu_count: Some(4),
                precision: "bfloat16".to_string(),
                backend: "vllm".to_string(),
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "Ready");
        assert_eq!(json["selectedRecipe"]["gpuCount"], 4);
        assert!(json["selectedRecipe"].get("namespace").is_none());
    }
}
