//! AIMEndpoint controller implementation
//!
//! Phase transitions:
//! - (new) → finalizer added → `Reconciling` at the start of every pass
//! - `Reconciling` → `Failed` when no recipe can be resolved
//! - `Reconciling` → `Pending` / `Ready` once the workload is applied,
//!   depending on whether a replica passes readiness
//!
//! The resolved recipe is a snapshot: it is reused until the endpoint's
//! generation changes, so edits to a recipe never silently reshape running
//! endpoints.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture, FutureExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use aim_common::crd::{
    AIMEndpoint, AIMEndpointStatus, AIMRecipe, Condition, ConditionStatus, EndpointPhase,
    SelectedRecipe,
};
use aim_common::kube_utils::{
    add_finalizer, apply_namespaced, has_finalizer, is_being_deleted, patch_resource_status,
    remove_finalizer,
};
use aim_common::{Error, ENDPOINT_FINALIZER};

use crate::compiler::{CompiledEndpoint, EndpointCompiler};
use crate::monitoring::{MonitoringHook, NoopMonitoring};
use crate::selection::{
    pinned_lookup_error, pinned_recipe_ref, pinned_snapshot, uses_auto_selection,
    RecipeSelector,
};
use crate::status::workload_status;

/// Field manager for all writes made by this controller
const FIELD_MANAGER: &str = "aim-endpoint-controller";

const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);
const SELECTION_RETRY: Duration = Duration::from_secs(60);
const READY_REQUEUE: Duration = Duration::from_secs(600);

/// Trait abstracting Kubernetes client operations for AIMEndpoint
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch the status of an AIMEndpoint
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &AIMEndpointStatus,
    ) -> Result<(), Error>;

    /// Add the endpoint finalizer
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Remove the endpoint finalizer
    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// List every AIMRecipe in the cluster
    async fn list_recipes(&self) -> Result<Vec<AIMRecipe>, Error>;

    /// Get an AIMRecipe by name and namespace
    async fn get_recipe(&self, name: &str, namespace: &str) -> Result<Option<AIMRecipe>, Error>;

    /// Server-side apply every compiled child of an endpoint
    async fn apply_compiled(&self, compiled: &CompiledEndpoint) -> Result<(), Error>;

    /// Get a Deployment by name and namespace
    async fn get_deployment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Deployment>, Error>;

    /// Get a Service by name and namespace
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error>;
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

type ApplyFuture<'a> = BoxFuture<'a, Result<(), Error>>;

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &AIMEndpointStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<AIMEndpoint>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await
    }

    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        add_finalizer::<AIMEndpoint>(
            &self.client,
            name,
            namespace,
            ENDPOINT_FINALIZER,
            FIELD_MANAGER,
        )
        .await
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        remove_finalizer::<AIMEndpoint>(
            &self.client,
            name,
            namespace,
            ENDPOINT_FINALIZER,
            FIELD_MANAGER,
        )
        .await
    }

    async fn list_recipes(&self) -> Result<Vec<AIMRecipe>, Error> {
        let api: Api<AIMRecipe> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_recipe(&self, name: &str, namespace: &str) -> Result<Option<AIMRecipe>, Error> {
        let api: Api<AIMRecipe> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn apply_compiled(&self, compiled: &CompiledEndpoint) -> Result<(), Error> {
        let client = &self.client;

        // Layer 1: what the pods mount
        let mut layer1: Vec<ApplyFuture<'_>> =
            vec![apply_namespaced(client, &compiled.config_map, FIELD_MANAGER).boxed()];
        if let Some(pvc) = &compiled.cache_pvc {
            layer1.push(apply_namespaced(client, pvc, FIELD_MANAGER).boxed());
        }
        try_join_all(layer1).await?;

        // Layer 2: the workload and everything pointing at it
        let mut layer2: Vec<ApplyFuture<'_>> = vec![
            apply_namespaced(client, &compiled.deployment, FIELD_MANAGER).boxed(),
            apply_namespaced(client, &compiled.service, FIELD_MANAGER).boxed(),
        ];
        if let Some(hpa) = &compiled.hpa {
            layer2.push(apply_namespaced(client, hpa, FIELD_MANAGER).boxed());
        }
        try_join_all(layer2).await?;
        Ok(())
    }

    async fn get_deployment(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Controller context for the AIMEndpoint controller
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Automatic recipe selection policy
    pub selector: RecipeSelector,
    /// Child resource compiler
    pub compiler: EndpointCompiler,
    /// Monitoring integration
    pub monitoring: Arc<dyn MonitoringHook>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>) -> Self {
        Self {
            kube,
            selector: RecipeSelector::default(),
            compiler: EndpointCompiler::default(),
            monitoring: Arc::new(NoopMonitoring),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    selector: RecipeSelector,
    compiler: EndpointCompiler,
    monitoring: Arc<dyn MonitoringHook>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            selector: RecipeSelector::default(),
            compiler: EndpointCompiler::default(),
            monitoring: Arc::new(NoopMonitoring),
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Set the automatic recipe selection policy
    pub fn recipe_selector(mut self, selector: RecipeSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Set the child resource compiler
    pub fn compiler(mut self, compiler: EndpointCompiler) -> Self {
        self.compiler = compiler;
        self
    }

    /// Set the monitoring integration
    pub fn monitoring(mut self, monitoring: Arc<dyn MonitoringHook>) -> Self {
        self.monitoring = monitoring;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client))),
            selector: self.selector,
            compiler: self.compiler,
            monitoring: self.monitoring,
        }
    }
}

/// Reconcile an AIMEndpoint
#[instrument(skip(endpoint, ctx), fields(endpoint = %endpoint.name_any()))]
pub async fn reconcile(endpoint: Arc<AIMEndpoint>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = endpoint.name_any();
    let namespace = endpoint
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "AIMEndpoint must be namespaced"))?;
    debug!("reconciling endpoint");

    if is_being_deleted(endpoint.as_ref()) {
        if has_finalizer(endpoint.as_ref(), ENDPOINT_FINALIZER) {
            info!("Removing finalizer");
            ctx.kube.remove_finalizer(&name, &namespace).await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(endpoint.as_ref(), ENDPOINT_FINALIZER) {
        info!("Adding finalizer");
        ctx.kube.add_finalizer(&name, &namespace).await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    let mut current = endpoint.status.clone();
    if needs_bootstrap(&endpoint) {
        let status = reconciling_status(current.as_ref());
        info!("Marking endpoint Reconciling");
        ctx.kube.patch_status(&name, &namespace, &status).await?;
        current = Some(status);
    }

    let selected = match resolve_recipe(&endpoint, &ctx).await {
        Ok(selected) => selected,
        Err(e @ Error::Selection { .. }) => {
            warn!(error = %e.message(), "Recipe selection failed");
            let status = failed_status(&endpoint, current.as_ref(), &e);
            update_status(current.as_ref(), &name, &namespace, &ctx, status).await?;
            return Ok(Action::requeue(SELECTION_RETRY));
        }
        Err(e) => return Err(e),
    };

    let compiled = ctx.compiler.compile(&endpoint, Some(&selected))?;
    ctx.kube.apply_compiled(&compiled).await?;

    if endpoint.spec.monitoring_enabled() {
        ctx.monitoring.ensure(&endpoint).await?;
    }

    let deployment = ctx.kube.get_deployment(&name, &namespace).await?;
    let service = ctx.kube.get_service(&name, &namespace).await?;
    let previous_conditions = current
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    let status = workload_status(
        &endpoint,
        Some(selected),
        deployment.as_ref(),
        service.as_ref(),
        previous_conditions,
    );
    update_status(current.as_ref(), &name, &namespace, &ctx, status).await?;

    Ok(Action::requeue(READY_REQUEUE))
}

/// Every pass is announced as `Reconciling` unless it already is
fn needs_bootstrap(endpoint: &AIMEndpoint) -> bool {
    let phase = endpoint.status.as_ref().and_then(|s| s.phase.as_ref());
    phase != Some(&EndpointPhase::Reconciling)
}

fn reconciling_status(previous: Option<&AIMEndpointStatus>) -> AIMEndpointStatus {
    let previous = previous.cloned().unwrap_or_default();
    let condition = Condition::new(
        "Reconciling",
        ConditionStatus::True,
        "Reconciling",
        "Reconciling AIMEndpoint",
    )
    .transition_from(&previous.conditions);
    AIMEndpointStatus {
        phase: Some(EndpointPhase::Reconciling),
        conditions: vec![condition],
        ..previous
    }
}

fn failed_status(
    endpoint: &AIMEndpoint,
    previous: Option<&AIMEndpointStatus>,
    error: &Error,
) -> AIMEndpointStatus {
    let previous = previous.cloned().unwrap_or_default();
    let condition = Condition::new(
        "Failed",
        ConditionStatus::True,
        "RecipeSelectionFailed",
        format!("Failed to select recipe: {}", error.message()),
    )
    .transition_from(&previous.conditions);
    AIMEndpointStatus {
        phase: Some(EndpointPhase::Failed),
        conditions: vec![condition],
        observed_generation: endpoint.metadata.generation,
        selected_recipe: None,
        ..previous
    }
}

/// Snapshot resolved for the current generation, if any
fn reusable_snapshot(endpoint: &AIMEndpoint) -> Option<SelectedRecipe> {
    let status = endpoint.status.as_ref()?;
    if status.phase == Some(EndpointPhase::Failed)
        || status.observed_generation != endpoint.metadata.generation
    {
        return None;
    }
    status.selected_recipe.clone()
}

/// Resolve the recipe snapshot for this pass.
///
/// Returns `Error::Selection` when no recipe fits; any other error is an
/// infrastructure failure.
async fn resolve_recipe(endpoint: &AIMEndpoint, ctx: &Context) -> Result<SelectedRecipe, Error> {
    if let Some(snapshot) = reusable_snapshot(endpoint) {
        debug!(recipe = %snapshot.name, "reusing resolved recipe");
        return Ok(snapshot);
    }

    let name = endpoint.name_any();
    let selected = if uses_auto_selection(&endpoint.spec) {
        let recipes = ctx.kube.list_recipes().await?;
        ctx.selector.select(endpoint, &recipes)?
    } else {
        let (recipe, recipe_ns) = pinned_recipe_ref(endpoint).ok_or_else(|| {
            Error::internal_with_context("resolve_recipe", "pinned recipe reference missing")
        })?;
        match ctx.kube.get_recipe(&recipe, &recipe_ns).await {
            Ok(Some(found)) => pinned_snapshot(&found),
            Ok(None) => return Err(pinned_lookup_error(&name, &recipe, "not found")),
            Err(e) => return Err(pinned_lookup_error(&name, &recipe, e.message())),
        }
    };

    info!(
        recipe = %selected.name,
        gpus = ?selected.gpu_count,
        precision = %selected.precision,
        backend = %selected.backend,
        "Recipe resolved"
    );
    Ok(selected)
}

async fn update_status(
    current: Option<&AIMEndpointStatus>,
    name: &str,
    namespace: &str,
    ctx: &Context,
    status: AIMEndpointStatus,
) -> Result<(), Error> {
    if current == Some(&status) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    info!(phase = ?status.phase, "Updating endpoint status");
    ctx.kube.patch_status(name, namespace, &status).await
}

/// Error policy for the AIMEndpoint controller
///
/// Logs the error and requeues for retry after 30 seconds.
pub fn error_policy(endpoint: Arc<AIMEndpoint>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        endpoint = %endpoint.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aim_common::crd::{AIMEndpointSpec, AIMRecipeSpec, GpuConfiguration};
    use aim_common::AMD_GPU_RESOURCE;
    use chrono::Utc;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use crate::monitoring::MockMonitoringHook;

    fn sample_endpoint(extra: serde_json::Value) -> AIMEndpoint {
        let mut json = serde_json::json!({
            "model": {"id": "org/model-7b"},
            "recipe": {"autoSelect": true},
            "resources": {"gpuCount": 4}
        });
        if let (Some(base), Some(extra)) = (json.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        let spec: AIMEndpointSpec = serde_json::from_value(json).expect("valid endpoint spec");
        let mut ep = AIMEndpoint::new("chat", spec);
        ep.metadata.namespace = Some("ml".to_string());
        ep.metadata.uid = Some("ep-uid".to_string());
        ep.metadata.generation = Some(1);
        ep.metadata.finalizers = Some(vec![ENDPOINT_FINALIZER.to_string()]);
        ep
    }

    fn sample_recipe(name: &str) -> AIMRecipe {
        let mut recipe = AIMRecipe::new(
            name,
            AIMRecipeSpec {
                model_id: "org/model-7b".to_string(),
                hardware: "MI300X".to_string(),
                precision: "bfloat16".to_string(),
                backend: "vllm".to_string(),
                description: None,
                configurations: vec![GpuConfiguration {
                    gpu_count: 4,
                    enabled: true,
                    ..Default::default()
                }],
                performance: None,
            },
        );
        recipe.metadata.namespace = Some("ml".to_string());
        recipe.metadata.creation_timestamp = Some(Time(Utc::now()));
        recipe
    }

    fn t1_snapshot() -> SelectedRecipe {
        SelectedRecipe {
            name: "t1".to_string(),
            namespace: Some("ml".to_string()),
            gpu_count: Some(4),
            precision: "bfloat16".to_string(),
            backend: "vllm".to_string(),
        }
    }

    fn ready_deployment() -> Deployment {
        Deployment {
            status: Some(DeploymentStatus {
                replicas: Some(1),
                ready_replicas: Some(1),
                available_replicas: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Endpoint lifecycle tests
    ///
    /// Each test tells the story of one reconcile: what the controller sees,
    /// what it writes, and when it comes back.
    mod endpoint_lifecycle_flow {
        use super::*;

        use std::sync::{Arc as StdArc, Mutex};

        #[derive(Clone)]
        struct StatusCapture {
            updates: StdArc<Mutex<Vec<AIMEndpointStatus>>>,
        }

        impl StatusCapture {
            fn new() -> Self {
                Self {
                    updates: StdArc::new(Mutex::new(Vec::new())),
                }
            }

            fn record(&self, status: AIMEndpointStatus) {
                self.updates
                    .lock()
                    .expect("mutex should not be poisoned")
                    .push(status);
            }

            fn all(&self) -> Vec<AIMEndpointStatus> {
                self.updates
                    .lock()
                    .expect("mutex should not be poisoned")
                    .clone()
            }

            fn last(&self) -> Option<AIMEndpointStatus> {
                self.all().last().cloned()
            }

            fn phases(&self) -> Vec<Option<EndpointPhase>> {
                self.all().into_iter().map(|s| s.phase).collect()
            }
        }

        /// Mock that records status writes and serves a ready workload.
        /// Recipe reads and applies are left to each story.
        fn mock_with_capture(capture: &StatusCapture) -> MockKubeClient {
            let capture_clone = capture.clone();
            let mut mock = MockKubeClient::new();
            mock.expect_patch_status().returning(move |_, _, status| {
                capture_clone.record(status.clone());
                Ok(())
            });
            mock.expect_get_deployment()
                .returning(|_, _| Ok(Some(ready_deployment())));
            mock.expect_get_service().returning(|_, _| Ok(None));
            mock
        }

        fn serve_recipes(mock: &mut MockKubeClient, recipes: Vec<AIMRecipe>) {
            mock.expect_list_recipes()
                .returning(move || Ok(recipes.clone()));
        }

        fn context(mock: MockKubeClient) -> Arc<Context> {
            Arc::new(Context::for_testing(Arc::new(mock)))
        }

        /// Story: A new endpoint gets its finalizer before anything else.
        #[tokio::test]
        async fn story_new_endpoint_gets_finalizer() {
            let mut ep = sample_endpoint(serde_json::json!({}));
            ep.metadata.finalizers = None;

            let mut mock = MockKubeClient::new();
            mock.expect_add_finalizer().times(1).returning(|_, _| Ok(()));
            mock.expect_list_recipes().never();

            let action = reconcile(Arc::new(ep), context(mock))
                .await
                .expect("reconcile should succeed");
            assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        }

        /// Story: An auto-selecting endpoint asking for 4 GPUs resolves the
        /// only matching recipe, applies its workload and becomes Ready.
        #[tokio::test]
        async fn story_auto_selection_resolves_recipe_and_goes_ready() {
            let capture = StatusCapture::new();
            let mut mock = mock_with_capture(&capture);
            serve_recipes(&mut mock, vec![sample_recipe("t1")]);
            mock.expect_apply_compiled()
                .times(1)
                .withf(|compiled| {
                    let pod = compiled
                        .deployment
                        .spec
                        .as_ref()
                        .and_then(|s| s.template.spec.as_ref());
                    let gpus = pod
                        .and_then(|p| p.containers[0].resources.as_ref())
                        .and_then(|r| r.limits.as_ref())
                        .and_then(|l| l.get(AMD_GPU_RESOURCE).cloned());
                    gpus == Some(Quantity("4".to_string()))
                })
                .returning(|_| Ok(()));

            let ep = sample_endpoint(serde_json::json!({}));
            let action = reconcile(Arc::new(ep), context(mock))
                .await
                .expect("reconcile should succeed");

            assert_eq!(action, Action::requeue(Duration::from_secs(600)));
            assert_eq!(
                capture.phases(),
                vec![Some(EndpointPhase::Reconciling), Some(EndpointPhase::Ready)]
            );
            let first = &capture.all()[0];
            assert_eq!(first.conditions[0].type_, "Reconciling");
            assert_eq!(first.conditions[0].message, "Reconciling AIMEndpoint");

            let status = capture.last().expect("status should be updated");
            assert_eq!(status.selected_recipe, Some(t1_snapshot()));
            assert_eq!(status.observed_generation, Some(1));
            assert_eq!(status.conditions[0].reason, "DeploymentReady");
        }

        /// Story: Asking for a GPU count the recipe does not offer fails
        /// selection and applies nothing.
        #[tokio::test]
        async fn story_unsupported_gpu_count_fails_selection() {
            let capture = StatusCapture::new();
            let mut mock = mock_with_capture(&capture);
            serve_recipes(&mut mock, vec![sample_recipe("t1")]);
            mock.expect_apply_compiled().never();

            let ep = sample_endpoint(serde_json::json!({"resources": {"gpuCount": 2}}));
            let action = reconcile(Arc::new(ep), context(mock))
                .await
                .expect("selection failure is not a reconcile error");

            assert_eq!(action, Action::requeue(Duration::from_secs(60)));
            let status = capture.last().expect("status should be updated");
            assert_eq!(status.phase, Some(EndpointPhase::Failed));
            assert_eq!(status.conditions[0].type_, "Failed");
            assert_eq!(status.conditions[0].reason, "RecipeSelectionFailed");
            assert_eq!(
                status.conditions[0].message,
                "Failed to select recipe: no suitable configuration found for 2 GPUs"
            );
            assert!(status.selected_recipe.is_none());
        }

        /// Story: A failed endpoint is retried on every pass, announcing
        /// Reconciling before settling back on Failed.
        #[tokio::test]
        async fn story_repeated_failure_passes_through_reconciling() {
            let capture = StatusCapture::new();
            let mut mock = mock_with_capture(&capture);
            serve_recipes(&mut mock, vec![]);
            mock.expect_apply_compiled().never();
            let mut ep = sample_endpoint(serde_json::json!({}));
            let error = Error::selection("chat", "no recipe found for model org/model-7b");
            ep.status = Some(failed_status(&ep, None, &error));

            let action = reconcile(Arc::new(ep), context(mock))
                .await
                .expect("reconcile should succeed");

            assert_eq!(action, Action::requeue(Duration::from_secs(60)));
            assert_eq!(
                capture.phases(),
                vec![Some(EndpointPhase::Reconciling), Some(EndpointPhase::Failed)]
            );
            let status = capture.last().expect("status should be updated");
            assert_eq!(status.conditions[0].reason, "RecipeSelectionFailed");
        }

        /// Story: A Ready endpoint re-reconciled at the same generation shows
        /// Reconciling while in flight and reuses its snapshot.
        #[tokio::test]
        async fn story_steady_state_reuses_snapshot() {
            let capture = StatusCapture::new();
            let mut mock = MockKubeClient::new();
            let capture_clone = capture.clone();
            mock.expect_patch_status().returning(move |_, _, status| {
                capture_clone.record(status.clone());
                Ok(())
            });
            mock.expect_list_recipes().never();
            mock.expect_get_recipe().never();
            mock.expect_apply_compiled().times(1).returning(|_| Ok(()));
            mock.expect_get_deployment()
                .returning(|_, _| Ok(Some(ready_deployment())));
            mock.expect_get_service().returning(|_, _| Ok(None));

            let mut ep = sample_endpoint(serde_json::json!({}));
            ep.status = Some(workload_status(
                &ep,
                Some(t1_snapshot()),
                Some(&ready_deployment()),
                None,
                &[],
            ));

            reconcile(Arc::new(ep), context(mock))
                .await
                .expect("reconcile should succeed");
            assert_eq!(
                capture.phases(),
                vec![Some(EndpointPhase::Reconciling), Some(EndpointPhase::Ready)]
            );
            let status = capture.last().expect("status should be updated");
            assert_eq!(status.selected_recipe, Some(t1_snapshot()));
        }

        /// Story: Editing the spec bumps the generation, which announces
        /// Reconciling and resolves the recipe afresh.
        #[tokio::test]
        async fn story_new_generation_reselects_recipe() {
            let capture = StatusCapture::new();
            let mut mock = mock_with_capture(&capture);
            mock.expect_list_recipes()
                .times(1)
                .returning(|| Ok(vec![sample_recipe("t1")]));
            mock.expect_apply_compiled().returning(|_| Ok(()));

            let mut ep = sample_endpoint(serde_json::json!({}));
            let mut stale = t1_snapshot();
            stale.name = "retired".to_string();
            ep.status = Some(workload_status(
                &ep,
                Some(stale),
                Some(&ready_deployment()),
                None,
                &[],
            ));
            ep.metadata.generation = Some(2);

            reconcile(Arc::new(ep), context(mock))
                .await
                .expect("reconcile should succeed");

            assert_eq!(capture.phases()[0], Some(EndpointPhase::Reconciling));
            let status = capture.last().expect("status should be updated");
            assert_eq!(status.selected_recipe, Some(t1_snapshot()));
            assert_eq!(status.observed_generation, Some(2));
        }

        /// Story: A pinned recipe is read from its namespace and adopted
        /// without a GPU count.
        #[tokio::test]
        async fn story_pinned_recipe_is_adopted() {
            let capture = StatusCapture::new();
            let mut mock = mock_with_capture(&capture);
            mock.expect_list_recipes().never();
            mock.expect_apply_compiled().returning(|_| Ok(()));
            mock.expect_get_recipe()
                .withf(|name, ns| name == "tuned" && ns == "shared")
                .times(1)
                .returning(|_, _| {
                    let mut recipe = sample_recipe("tuned");
                    recipe.metadata.namespace = Some("shared".to_string());
                    Ok(Some(recipe))
                });

            let ep = sample_endpoint(serde_json::json!({
                "recipe": {"customRecipe": {"name": "tuned", "namespace": "shared"}}
            }));
            reconcile(Arc::new(ep), context(mock))
                .await
                .expect("reconcile should succeed");

            let selected = capture
                .last()
                .and_then(|s| s.selected_recipe)
                .expect("snapshot");
            assert_eq!(selected.name, "tuned");
            assert_eq!(selected.namespace.as_deref(), Some("shared"));
            assert_eq!(selected.gpu_count, None);
        }

        /// Story: A missing pinned recipe fails selection with its name.
        #[tokio::test]
        async fn story_missing_pinned_recipe_fails() {
            let capture = StatusCapture::new();
            let mut mock = mock_with_capture(&capture);
            mock.expect_get_recipe().returning(|_, _| Ok(None));
            mock.expect_apply_compiled().never();

            let ep = sample_endpoint(serde_json::json!({
                "recipe": {"customRecipe": {"name": "tuned"}}
            }));
            let action = reconcile(Arc::new(ep), context(mock))
                .await
                .expect("reconcile should succeed");

            assert_eq!(action, Action::requeue(Duration::from_secs(60)));
            let status = capture.last().expect("status should be updated");
            assert_eq!(
                status.conditions[0].message,
                "Failed to select recipe: failed to get custom recipe tuned: not found"
            );
        }

        /// Story: Monitoring-enabled endpoints go through the monitoring hook.
        #[tokio::test]
        async fn story_monitoring_hook_invoked_when_enabled() {
            let capture = StatusCapture::new();
            let mut mock = mock_with_capture(&capture);
            serve_recipes(&mut mock, vec![sample_recipe("t1")]);
            mock.expect_apply_compiled().returning(|_| Ok(()));
            let mut hook = MockMonitoringHook::new();
            hook.expect_ensure()
                .withf(|ep| ep.name_any() == "chat")
                .times(1)
                .returning(|_| Ok(()));
            let ctx = Arc::new(Context {
                monitoring: Arc::new(hook),
                ..Context::for_testing(Arc::new(mock))
            });

            let ep = sample_endpoint(serde_json::json!({"monitoring": {"enabled": true}}));
            reconcile(Arc::new(ep), ctx)
                .await
                .expect("reconcile should succeed");
        }

        /// Story: Monitoring stays untouched for endpoints that do not ask for it.
        #[tokio::test]
        async fn story_monitoring_hook_skipped_when_disabled() {
            let capture = StatusCapture::new();
            let mut mock = mock_with_capture(&capture);
            serve_recipes(&mut mock, vec![sample_recipe("t1")]);
            mock.expect_apply_compiled().returning(|_| Ok(()));
            let mut hook = MockMonitoringHook::new();
            hook.expect_ensure().never();
            let ctx = Arc::new(Context {
                monitoring: Arc::new(hook),
                ..Context::for_testing(Arc::new(mock))
            });

            reconcile(Arc::new(sample_endpoint(serde_json::json!({}))), ctx)
                .await
                .expect("reconcile should succeed");
        }

        /// Story: Without a ready replica the endpoint stays Pending.
        #[tokio::test]
        async fn story_unready_workload_is_pending() {
            let capture = StatusCapture::new();
            let mut mock = MockKubeClient::new();
            let capture_clone = capture.clone();
            mock.expect_patch_status().returning(move |_, _, status| {
                capture_clone.record(status.clone());
                Ok(())
            });
            mock.expect_list_recipes()
                .returning(|| Ok(vec![sample_recipe("t1")]));
            mock.expect_apply_compiled().returning(|_| Ok(()));
            mock.expect_get_deployment().returning(|_, _| Ok(None));
            mock.expect_get_service().returning(|_, _| Ok(None));

            let ep = sample_endpoint(serde_json::json!({}));
            reconcile(Arc::new(ep), context(mock))
                .await
                .expect("reconcile should succeed");

            let status = capture.last().expect("status should be updated");
            assert_eq!(status.phase, Some(EndpointPhase::Pending));
            assert_eq!(status.conditions[0].reason, "DeploymentNotReady");
        }

        /// Story: A deleted endpoint only releases its finalizer.
        #[tokio::test]
        async fn story_deletion_removes_finalizer() {
            let mut ep = sample_endpoint(serde_json::json!({}));
            ep.metadata.deletion_timestamp = Some(Time(Utc::now()));

            let mut mock = MockKubeClient::new();
            mock.expect_remove_finalizer()
                .times(1)
                .returning(|_, _| Ok(()));
            mock.expect_apply_compiled().never();
            mock.expect_patch_status().never();

            let action = reconcile(Arc::new(ep), context(mock))
                .await
                .expect("reconcile should succeed");
            assert_eq!(action, Action::await_change());
        }

        /// Story: Failing to list recipes is an infrastructure error, not a
        /// selection failure.
        #[tokio::test]
        async fn story_recipe_list_failure_propagates() {
            let mut mock = MockKubeClient::new();
            mock.expect_patch_status().returning(|_, _, _| Ok(()));
            mock.expect_list_recipes()
                .returning(|| Err(Error::internal_with_context("list", "connection reset")));
            mock.expect_apply_compiled().never();

            let ep = sample_endpoint(serde_json::json!({}));
            let result = reconcile(Arc::new(ep), context(mock)).await;
            assert!(matches!(result, Err(Error::Internal { .. })));
        }

        /// Story: Apply failures surface as reconcile errors.
        #[tokio::test]
        async fn story_apply_failure_propagates() {
            let mut mock = MockKubeClient::new();
            mock.expect_patch_status().returning(|_, _, _| Ok(()));
            mock.expect_list_recipes()
                .returning(|| Ok(vec![sample_recipe("t1")]));
            mock.expect_apply_compiled()
                .returning(|_| Err(Error::internal_with_context("apply", "conflict")));
            mock.expect_get_deployment().never();

            let ep = sample_endpoint(serde_json::json!({}));
            let result = reconcile(Arc::new(ep), context(mock)).await;
            assert!(result.is_err());
        }
    }

    mod bootstrap_gate {
        use super::*;
        use rstest::rstest;

        #[test]
        fn fresh_endpoint_needs_bootstrap() {
            assert!(needs_bootstrap(&sample_endpoint(serde_json::json!({}))));
        }

        #[rstest]
        #[case::ready(EndpointPhase::Ready)]
        #[case::pending(EndpointPhase::Pending)]
        #[case::failed(EndpointPhase::Failed)]
        fn settled_phase_at_observed_generation_needs_bootstrap(#[case] phase: EndpointPhase) {
            let mut ep = sample_endpoint(serde_json::json!({}));
            ep.status = Some(AIMEndpointStatus {
                phase: Some(phase),
                observed_generation: Some(1),
                ..Default::default()
            });
            assert!(needs_bootstrap(&ep));
        }

        #[test]
        fn already_reconciling_skips_bootstrap() {
            let mut ep = sample_endpoint(serde_json::json!({}));
            ep.status = Some(AIMEndpointStatus {
                phase: Some(EndpointPhase::Reconciling),
                ..Default::default()
            });
            assert!(!needs_bootstrap(&ep));
        }

        #[test]
        fn failed_snapshot_is_never_reused() {
            let mut ep = sample_endpoint(serde_json::json!({}));
            ep.status = Some(AIMEndpointStatus {
                phase: Some(EndpointPhase::Failed),
                observed_generation: Some(1),
                selected_recipe: Some(t1_snapshot()),
                ..Default::default()
            });
            assert!(reusable_snapshot(&ep).is_none());
        }
    }

    mod error_policy_tests {
        use super::*;

        use rstest::rstest;

        #[rstest]
        #[case::selection_error(Error::selection("chat", "no recipe"))]
        #[case::internal_error(Error::internal("boom"))]
        fn test_error_policy_always_requeues_after_30s(#[case] error: Error) {
            let ctx = Arc::new(Context::for_testing(Arc::new(MockKubeClient::new())));
            let action = error_policy(
                Arc::new(sample_endpoint(serde_json::json!({}))),
                &error,
                ctx,
            );
            assert_eq!(action, Action::requeue(Duration::from_secs(30)));
        }
    }
}
