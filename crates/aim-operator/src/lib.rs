//! AIM Kubernetes operator: runs the recipe, cache and endpoint controllers

#![deny(missing_docs)]

/// Command-line surface and operator configuration
pub mod config;
/// Controller construction for each AIM kind
pub mod controller_runner;
/// CRD generation and installation
pub mod crds;
