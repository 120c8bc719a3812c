//! Recipe selection for endpoints
//!
//! Automatic selection narrows every recipe in the cluster down to the ones
//! serving the endpoint's model, drops invalid recipes and those not matching
//! the optional precision/backend filters, then lets a [`RecipeScorer`] pick
//! one. A [`GpuFallbackPolicy`] chooses the GPU configuration within it.
//!
//! Pinned selection adopts the named recipe as is; its GPU count stays unset.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, info};

use aim_common::crd::{
    AIMEndpoint, AIMEndpointSpec, AIMRecipe, AIMRecipeSpec, GpuConfiguration, SelectedRecipe,
};
use aim_common::Error;

/// GPU counts tried by [`GpuFallbackPolicy::Ladder`], largest first
pub const GPU_LADDER: [i32; 4] = [8, 4, 2, 1];

/// Ranks candidate recipes; the candidate ordered first wins
pub trait RecipeScorer: Send + Sync {
    /// Compare two candidates
    fn compare(&self, a: &AIMRecipe, b: &AIMRecipe) -> Ordering;
}

/// Prefers the oldest recipe, then namespace/name order.
///
/// Recipes without a creation timestamp (not yet persisted) rank last.
#[derive(Clone, Copy, Debug, Default)]
pub struct EarliestCreated;

impl RecipeScorer for EarliestCreated {
    fn compare(&self, a: &AIMRecipe, b: &AIMRecipe) -> Ordering {
        let key = |r: &AIMRecipe| {
            let created = r.creation_timestamp().map(|t| t.0);
            (created.is_none(), created, r.namespace(), r.name_any())
        };
        key(a).cmp(&key(b))
    }
}

/// How a GPU configuration is chosen when the exact count is not offered
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GpuFallbackPolicy {
    /// Only an enabled configuration with exactly the requested count
    #[default]
    ExactMatch,
    /// The requested count, then each smaller step of 8, 4, 2, 1
    Ladder,
}

impl GpuFallbackPolicy {
    /// Choose a configuration of `recipe` for `requested` GPUs
    pub fn configuration<'a>(
        &self,
        recipe: &'a AIMRecipeSpec,
        requested: i32,
    ) -> Option<&'a GpuConfiguration> {
        match self {
            Self::ExactMatch => recipe.enabled_configuration(requested),
            Self::Ladder => std::iter::once(requested)
                .chain(GPU_LADDER.into_iter().filter(|&n| n < requested))
                .find_map(|n| recipe.enabled_configuration(n)),
        }
    }
}

impl FromStr for GpuFallbackPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exact" | "exact-match" => Ok(Self::ExactMatch),
            "ladder" => Ok(Self::Ladder),
            _ => Err(Error::validation(format!("invalid GPU fallback policy: {s}"))),
        }
    }
}

impl fmt::Display for GpuFallbackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExactMatch => write!(f, "exact"),
            Self::Ladder => write!(f, "ladder"),
        }
    }
}

/// Whether the endpoint resolves its recipe automatically
pub fn uses_auto_selection(spec: &AIMEndpointSpec) -> bool {
    spec.recipe.auto_select || spec.recipe.custom_recipe.is_none()
}

/// Name and namespace of the recipe an endpoint pins, if it pins one
pub fn pinned_recipe_ref(endpoint: &AIMEndpoint) -> Option<(String, String)> {
    let custom = endpoint.spec.recipe.custom_recipe.as_ref()?;
    let namespace = custom
        .namespace
        .clone()
        .or_else(|| endpoint.namespace())
        .unwrap_or_default();
    Some((custom.name.clone(), namespace))
}

/// Snapshot of a pinned recipe
pub fn pinned_snapshot(recipe: &AIMRecipe) -> SelectedRecipe {
    SelectedRecipe {
        name: recipe.name_any(),
        namespace: recipe.namespace(),
        gpu_count: None,
        precision: recipe.spec.precision.clone(),
        backend: recipe.spec.backend.clone(),
    }
}

/// Error for a pinned recipe that could not be read
pub fn pinned_lookup_error(endpoint: &str, recipe: &str, cause: impl fmt::Display) -> Error {
    Error::selection(endpoint, format!("failed to get custom recipe {recipe}: {cause}"))
}

/// Automatic recipe selection
#[derive(Clone)]
pub struct RecipeSelector {
    scorer: Arc<dyn RecipeScorer>,
    fallback: GpuFallbackPolicy,
}

impl Default for RecipeSelector {
    fn default() -> Self {
        Self::new(Arc::new(EarliestCreated), GpuFallbackPolicy::default())
    }
}

impl RecipeSelector {
    /// Create a selector with the given ranking and fallback policy
    pub fn new(scorer: Arc<dyn RecipeScorer>, fallback: GpuFallbackPolicy) -> Self {
        Self { scorer, fallback }
    }

    /// The configured GPU fallback policy
    pub fn fallback(&self) -> GpuFallbackPolicy {
        self.fallback
    }

    /// Select a recipe and GPU configuration for `endpoint` among `recipes`
    pub fn select(
        &self,
        endpoint: &AIMEndpoint,
        recipes: &[AIMRecipe],
    ) -> Result<SelectedRecipe, Error> {
        let name = endpoint.name_any();
        let spec = &endpoint.spec;
        let model_id = &spec.model.id;

        let best = recipes
            .iter()
            .filter(|r| r.spec.model_id == *model_id)
            .filter(|r| is_eligible(r, spec))
            .min_by(|a, b| self.scorer.compare(a, b))
            .ok_or_else(|| {
                Error::selection(&name, format!("no recipe found for model {model_id}"))
            })?;

        let requested = spec.requested_gpu_count();
        let config = self
            .fallback
            .configuration(&best.spec, requested)
            .ok_or_else(|| {
                Error::selection(
                    &name,
                    format!("no suitable configuration found for {requested} GPUs"),
                )
            })?;

        if config.gpu_count != requested {
            info!(
                recipe = %best.name_any(),
                requested,
                selected = config.gpu_count,
                "Falling back to a smaller GPU configuration"
            );
        }

        Ok(SelectedRecipe {
            name: best.name_any(),
            namespace: best.namespace(),
            gpu_count: Some(config.gpu_count),
            precision: best.spec.precision.clone(),
            backend: best.spec.backend.clone(),
        })
    }
}

fn is_eligible(recipe: &AIMRecipe, spec: &AIMEndpointSpec) -> bool {
    if let Err(e) = recipe.spec.validate() {
        debug!(recipe = %recipe.name_any(), error = %e.message(), "Skipping invalid recipe");
        return false;
    }
    let precision_ok = spec
        .recipe
        .precision
        .as_ref()
        .map_or(true, |p| *p == recipe.spec.precision);
    let backend_ok = spec
        .recipe
        .backend
        .as_ref()
        .map_or(true, |b| *b == recipe.spec.backend);
    precision_ok && backend_ok
}
