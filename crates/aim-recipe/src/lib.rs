//! AIMRecipe controller
//!
//! Validates recipes on every reconcile, republishes how many endpoints use
//! each recipe, and holds a finalizer so a recipe cannot disappear while an
//! endpoint's resolved snapshot still points at it.
//!
//! The controller is additionally triggered by endpoint watch events through
//! [`endpoint_to_recipe`], which keeps usage statistics current without
//! waiting for the periodic requeue.

#![deny(missing_docs)]

pub mod controller;

pub use controller::{
    endpoint_to_recipe, error_policy, reconcile, Context, ContextBuilder, KubeClient,
    KubeClientImpl,
};
