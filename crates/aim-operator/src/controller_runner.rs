//! Controller runner - builds controller futures for each AIM kind
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. This keeps controller construction pure and testable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{predicates, reflector, watcher, Controller, WatchStreamExt};
use kube::{Api, Client};

use aim_cache::pvc::CACHE_APP_NAME;
use aim_common::crd::{AIMCache, AIMEndpoint, AIMRecipe};
use aim_common::LABEL_NAME;
use aim_endpoint::compiler::{EndpointCompiler, ENDPOINT_APP_NAME};
use aim_endpoint::{
    EarliestCreated, MonitoringHook, NoopMonitoring, PrometheusMonitoring, RecipeSelector,
};

use crate::config::{MonitoringMode, OperatorConfig};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A running controller
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Watch only objects generated for the given AIM kind
fn children_config(app_name: &str) -> WatcherConfig {
    watcher_config().labels(&format!("{LABEL_NAME}={app_name}"))
}

fn endpoint_children_config() -> WatcherConfig {
    children_config(ENDPOINT_APP_NAME)
}

/// Build the AIMRecipe controller
///
/// Endpoint events re-trigger the recipe their snapshot references, so usage
/// statistics follow endpoint churn without waiting for the periodic requeue.
pub fn build_recipe_controllers(client: Client) -> Vec<ControllerFuture> {
    let ctx = Arc::new(aim_recipe::Context::builder(client.clone()).build());
    let recipes: Api<AIMRecipe> = Api::all(client.clone());
    let endpoints: Api<AIMEndpoint> = Api::all(client);

    tracing::info!("- AIMRecipe controller");

    vec![Box::pin(
        Controller::new(recipes, watcher_config())
            .watches(endpoints, watcher_config(), aim_recipe::endpoint_to_recipe)
            .shutdown_on_signal()
            .run(aim_recipe::reconcile, aim_recipe::error_policy, ctx)
            .for_each(log_reconcile_result("Recipe")),
    )]
}

/// Build the AIMCache controller
pub fn build_cache_controllers(client: Client) -> Vec<ControllerFuture> {
    let ctx = Arc::new(aim_cache::Context::builder(client.clone()).build());
    let caches: Api<AIMCache> = Api::all(client.clone());
    let claims: Api<PersistentVolumeClaim> = Api::all(client);

    tracing::info!("- AIMCache controller");

    vec![Box::pin(
        Controller::new(caches, watcher_config())
            .owns(claims, children_config(CACHE_APP_NAME))
            .shutdown_on_signal()
            .run(aim_cache::reconcile, aim_cache::error_policy, ctx)
            .for_each(log_reconcile_result("Cache")),
    )]
}

/// Build the AIMEndpoint controller
///
/// Endpoint events pass only when the generation changes: every pass writes
/// status twice and must not re-trigger itself. Owned children (Deployment,
/// Service, ConfigMap, cache claim, HPA) trigger a reconcile of their
/// endpoint whenever they change.
pub async fn build_endpoint_controllers(
    client: Client,
    config: &OperatorConfig,
) -> Vec<ControllerFuture> {
    let monitoring: Arc<dyn MonitoringHook> = match config.monitoring {
        MonitoringMode::None => Arc::new(NoopMonitoring),
        MonitoringMode::PrometheusOperator => {
            Arc::new(PrometheusMonitoring::discover(client.clone()).await)
        }
    };
    let selector = RecipeSelector::new(Arc::new(EarliestCreated), config.gpu_fallback);
    let ctx = Arc::new(
        aim_endpoint::Context::builder(client.clone())
            .recipe_selector(selector)
            .compiler(EndpointCompiler::new(config.image_registry.clone()))
            .monitoring(monitoring)
            .build(),
    );

    let endpoints: Api<AIMEndpoint> = Api::all(client.clone());
    let (reader, writer) = reflector::store();
    let endpoint_events = watcher(endpoints, watcher_config())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(predicates::generation);

    tracing::info!(
        gpu_fallback = %config.gpu_fallback,
        monitoring = ?config.monitoring,
        "- AIMEndpoint controller"
    );

    vec![Box::pin(
        Controller::for_stream(endpoint_events, reader)
            .owns(
                Api::<Deployment>::all(client.clone()),
                endpoint_children_config(),
            )
            .owns(Api::<Service>::all(client.clone()), endpoint_children_config())
            .owns(Api::<ConfigMap>::all(client.clone()), endpoint_children_config())
            .owns(
                Api::<PersistentVolumeClaim>::all(client.clone()),
                endpoint_children_config(),
            )
            .owns(
                Api::<HorizontalPodAutoscaler>::all(client),
                endpoint_children_config(),
            )
            .shutdown_on_signal()
            .run(aim_endpoint::reconcile, aim_endpoint::error_policy, ctx)
            .for_each(log_reconcile_result("Endpoint")),
    )]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
