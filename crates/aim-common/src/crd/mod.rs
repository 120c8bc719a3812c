//! Custom Resource Definitions for the AIM operator

mod cache;
mod endpoint;
mod recipe;
mod types;

pub use cache::{
    cache_pvc_name, AIMCache, AIMCacheSpec, AIMCacheStatus, CacheModelSpec, CachePhase,
    CacheStorageSpec, CacheUsage, CachedModelState, CachedModelStatus, CleanupSpec,
    StorageStatus, DEFAULT_ACCESS_MODE, DEFAULT_CACHE_MOUNT_PATH, DEFAULT_MAX_AGE,
};
pub use endpoint::{
    AIMEndpoint, AIMEndpointSpec, AIMEndpointStatus, CustomRecipeRef, DeploymentSettings,
    EndpointAddresses, EndpointCacheSpec, EndpointPhase, EndpointResources, ImageSpec,
    ModelRef, MonitoringSpec, PodSecurity, PrometheusSpec, RecipeSelectionSpec, ReplicaCounts,
    RollingUpdateSpec, ScalingSpec, SecuritySpec, SelectedRecipe, ServiceExposure, StrategySpec,
    DEFAULT_ENDPOINT_CACHE_SIZE,
};
pub use recipe::{
    AIMRecipe, AIMRecipeSpec, AIMRecipeStatus, Backend, ConfigurationResources, GpuConfiguration,
    HardwarePlatform, PerformanceSpec, Precision, RecipePhase, RecipeUsage, MAX_GPU_COUNT,
    MIN_GPU_COUNT,
};
pub use types::{is_condition_true, Condition, ConditionStatus};
