//! AIMRecipe controller implementation
//!
//! Per reconcile:
//! - ensure the deletion-protection finalizer is present
//! - on deletion, hold the finalizer while any endpoint's resolved recipe is
//!   this one, otherwise release it
//! - validate the spec and publish `Ready` (with usage) or `Invalid`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use aim_common::crd::{
    AIMEndpoint, AIMRecipe, AIMRecipeStatus, Condition, ConditionStatus, RecipePhase, RecipeUsage,
};
use aim_common::kube_utils::{
    add_finalizer, has_finalizer, is_being_deleted, patch_resource_status, remove_finalizer,
};
use aim_common::usage::{format_refs, UsageIndex};
use aim_common::{Error, RECIPE_FINALIZER};

/// Field manager for all writes made by this controller
const FIELD_MANAGER: &str = "aim-recipe-controller";

/// Requeue after adding the finalizer, to pick up the updated object
const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);
/// Recheck interval for invalid recipes and blocked deletions
const BLOCKED_REQUEUE: Duration = Duration::from_secs(300);
/// Periodic refresh of usage statistics for healthy recipes
const READY_REQUEUE: Duration = Duration::from_secs(600);

/// Trait abstracting Kubernetes client operations for AIMRecipe
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch the status of an AIMRecipe
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &AIMRecipeStatus,
    ) -> Result<(), Error>;

    /// Add the recipe finalizer
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Remove the recipe finalizer
    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// List every AIMEndpoint in the cluster.
    ///
    /// Deletion decisions read the live API rather than a watch cache so a
    /// freshly created reference is never missed.
    async fn list_endpoints(&self) -> Result<Vec<AIMEndpoint>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &AIMRecipeStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<AIMRecipe>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await
    }

    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        add_finalizer::<AIMRecipe>(&self.client, name, namespace, RECIPE_FINALIZER, FIELD_MANAGER)
            .await
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        remove_finalizer::<AIMRecipe>(
            &self.client,
            name,
            namespace,
            RECIPE_FINALIZER,
            FIELD_MANAGER,
        )
        .await
    }

    async fn list_endpoints(&self) -> Result<Vec<AIMEndpoint>, Error> {
        let api: Api<AIMEndpoint> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Controller context for the AIMRecipe controller
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client).build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self { client, kube: None }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client))),
        }
    }
}

/// Map an endpoint watch event to the recipe its snapshot references.
///
/// Endpoints without a resolved recipe trigger nothing. Snapshots that do not
/// record a namespace fall back to the endpoint's own namespace.
pub fn endpoint_to_recipe(endpoint: AIMEndpoint) -> Option<ObjectRef<AIMRecipe>> {
    let selected = endpoint.status.as_ref()?.selected_recipe.as_ref()?;
    let namespace = selected.namespace.clone().or_else(|| endpoint.namespace())?;
    Some(ObjectRef::new(&selected.name).within(&namespace))
}

/// Reconcile an AIMRecipe
#[instrument(skip(recipe, ctx), fields(recipe = %recipe.name_any()))]
pub async fn reconcile(recipe: Arc<AIMRecipe>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = recipe.name_any();
    let namespace = recipe
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "AIMRecipe must be namespaced"))?;
    debug!("reconciling recipe");

    if is_being_deleted(recipe.as_ref()) {
        return handle_deletion(&recipe, &name, &namespace, &ctx).await;
    }

    if !has_finalizer(recipe.as_ref(), RECIPE_FINALIZER) {
        info!("Adding finalizer");
        ctx.kube.add_finalizer(&name, &namespace).await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    if let Err(e) = recipe.spec.validate() {
        warn!(error = %e.message(), "Recipe validation failed");
        let condition = Condition::new(
            "Valid",
            ConditionStatus::False,
            "ValidationFailed",
            format!("Recipe validation failed: {}", e.message()),
        );
        let usage = recipe.status.as_ref().and_then(|s| s.usage.clone());
        let status = build_status(&recipe, RecipePhase::Invalid, condition, usage);
        update_status(&recipe, &name, &namespace, &ctx, status).await?;
        return Ok(Action::requeue(BLOCKED_REQUEUE));
    }

    let endpoints = ctx.kube.list_endpoints().await?;
    let usage = UsageIndex::build(&endpoints).recipe_usage(&namespace, &name);
    debug!(endpoints = usage.endpoint_count, "Recipe usage computed");

    let condition = Condition::new(
        "Valid",
        ConditionStatus::True,
        "ValidationSucceeded",
        "Recipe is valid and ready for use",
    );
    let status = build_status(&recipe, RecipePhase::Ready, condition, Some(usage));
    update_status(&recipe, &name, &namespace, &ctx, status).await?;

    Ok(Action::requeue(READY_REQUEUE))
}

/// Hold or release the finalizer of a recipe being deleted
async fn handle_deletion(
    recipe: &AIMRecipe,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<Action, Error> {
    if !has_finalizer(recipe, RECIPE_FINALIZER) {
        return Ok(Action::await_change());
    }

    let endpoints = ctx.kube.list_endpoints().await?;
    let index = UsageIndex::build(&endpoints);
    let users = index.recipe_users(namespace, name);

    if !users.is_empty() {
        let message = format!(
            "Cannot delete recipe: still in use by endpoints: {}",
            format_refs(&users)
        );
        warn!(endpoints = users.len(), "Recipe deletion blocked");
        let condition = Condition::new(
            "DeletionBlocked",
            ConditionStatus::True,
            "EndpointsStillUsing",
            message,
        );
        let usage = index.recipe_usage(namespace, name);
        let status = build_status(recipe, RecipePhase::DeletionBlocked, condition, Some(usage));
        update_status(recipe, name, namespace, ctx, status).await?;
        return Ok(Action::requeue(BLOCKED_REQUEUE));
    }

    info!("No endpoints reference recipe, removing finalizer");
    ctx.kube.remove_finalizer(name, namespace).await?;
    Ok(Action::await_change())
}

fn build_status(
    recipe: &AIMRecipe,
    phase: RecipePhase,
    condition: Condition,
    usage: Option<RecipeUsage>,
) -> AIMRecipeStatus {
    let previous = recipe
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    AIMRecipeStatus {
        phase,
        conditions: vec![condition.transition_from(previous)],
        observed_generation: recipe.metadata.generation,
        usage,
    }
}

/// Patch status unless it is already current.
///
/// Status writes generate watch events; skipping no-op writes keeps the
/// controller from reconciling itself in a loop.
async fn update_status(
    recipe: &AIMRecipe,
    name: &str,
    namespace: &str,
    ctx: &Context,
    status: AIMRecipeStatus,
) -> Result<(), Error> {
    if recipe.status.as_ref() == Some(&status) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    info!(phase = %status.phase, "Updating recipe status");
    ctx.kube.patch_status(name, namespace, &status).await
}

/// Error policy for the AIMRecipe controller
///
/// Logs the error and requeues for retry after 30 seconds.
pub fn error_policy(recipe: Arc<AIMRecipe>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        recipe = %recipe.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(30))
}
