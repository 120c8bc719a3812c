//! AIMCache controller
//!
//! Each AIMCache owns one PersistentVolumeClaim holding model weights. The
//! controller:
//! - provisions the claim and keeps its requested size in line with the spec
//! - tracks which declared models are in use by caching endpoints
//! - runs the cleanup policy, evicting stale entries by age and by free space
//! - blocks deletion while any endpoint still relies on caching

#![deny(missing_docs)]

pub mod cleanup;
pub mod controller;
pub mod inventory;
pub mod pvc;

pub use controller::{error_policy, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl};
