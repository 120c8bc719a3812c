//! AIMEndpoint controller
//!
//! Turns an endpoint ("serve model X") into a running inference workload:
//! - resolves a recipe, automatically by model id or pinned by name
//! - compiles the ConfigMap, cache claim, Deployment, Service and autoscaler
//! - hands monitoring objects to a pluggable [`monitoring::MonitoringHook`]
//! - reads replica counts and reachable addresses back onto the status

#![deny(missing_docs)]

pub mod compiler;
pub mod controller;
pub mod monitoring;
pub mod selection;
pub mod status;

pub use controller::{error_policy, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl};
pub use monitoring::{MonitoringHook, NoopMonitoring, PrometheusMonitoring};
pub use selection::{EarliestCreated, GpuFallbackPolicy, RecipeScorer, RecipeSelector};
