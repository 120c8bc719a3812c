//! Common types for the AIM operator: CRDs, errors, usage tracking and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod quantity;
pub mod usage;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all AIM custom resources
pub const AIM_GROUP: &str = "aim.engine.amd.com";

/// API version for all AIM custom resources
pub const AIM_API_VERSION: &str = "aim.engine.amd.com/v1alpha1";

/// Finalizer guarding AIMRecipe deletion while endpoints reference it
pub const RECIPE_FINALIZER: &str = "aimrecipe.aim.engine.amd.com/finalizer";

/// Finalizer guarding AIMCache deletion while endpoints cache models
pub const CACHE_FINALIZER: &str = "aimcache.aim.engine.amd.com/finalizer";

/// Finalizer held by AIMEndpoint until its controller releases it
pub const ENDPOINT_FINALIZER: &str = "aimendpoint.aim.engine.amd.com/finalizer";

/// Standard Kubernetes label for the application name
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Standard Kubernetes label for the owning instance
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

/// Standard Kubernetes label for the role of a generated object
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// Standard Kubernetes label for the managing controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on every generated object
pub const LABEL_MANAGED_BY_AIM: &str = "aim-operator";

/// Extended resource key for AMD GPUs
pub const AMD_GPU_RESOURCE: &str = "amd.com/gpu";

/// Port the inference server listens on inside the container
pub const SERVER_PORT: i32 = 8000;
