//! AIMCache controller implementation
//!
//! Phase transitions:
//! - (new) → finalizer added → `Ready` once the claim exists
//! - any → `DeletionBlocked` while caching endpoints remain after deletion
//!   was requested

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use aim_common::crd::{
    AIMCache, AIMCacheStatus, AIMEndpoint, CachePhase, Condition, ConditionStatus,
};
use aim_common::kube_utils::{
    add_finalizer, has_finalizer, is_being_deleted, patch_resource_status, remove_finalizer,
};
use aim_common::quantity::parse_quantity_bytes;
use aim_common::usage::{format_refs, UsageIndex};
use aim_common::{Error, CACHE_FINALIZER};

use crate::cleanup::{is_due, run_cleanup};
use crate::inventory::{cache_usage, reconcile_inventory, storage_status};
use crate::pvc::{build_cache_pvc, is_shrink, mutable_fields_patch, needs_update};

/// Field manager for all writes made by this controller
const FIELD_MANAGER: &str = "aim-cache-controller";

const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);
const BLOCKED_REQUEUE: Duration = Duration::from_secs(300);
const READY_REQUEUE: Duration = Duration::from_secs(900);

/// Trait abstracting Kubernetes client operations for AIMCache
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch the status of an AIMCache
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &AIMCacheStatus,
    ) -> Result<(), Error>;

    /// Add the cache finalizer
    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Remove the cache finalizer
    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// List every AIMEndpoint in the cluster
    async fn list_endpoints(&self) -> Result<Vec<AIMEndpoint>, Error>;

    /// Get a PersistentVolumeClaim by name and namespace
    async fn get_pvc(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Create a PersistentVolumeClaim, returning the stored object
    async fn create_pvc(&self, pvc: &PersistentVolumeClaim)
        -> Result<PersistentVolumeClaim, Error>;

    /// Merge-patch an existing PersistentVolumeClaim, returning the stored object
    async fn patch_pvc(
        &self,
        name: &str,
        namespace: &str,
        patch: &serde_json::Value,
    ) -> Result<PersistentVolumeClaim, Error>;
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
        status: &AIMCacheStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<AIMCache>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await
    }

    async fn add_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        add_finalizer::<AIMCache>(&self.client, name, namespace, CACHE_FINALIZER, FIELD_MANAGER)
            .await
    }

    async fn remove_finalizer(&self, name: &str, namespace: &str) -> Result<(), Error> {
        remove_finalizer::<AIMCache>(&self.client, name, namespace, CACHE_FINALIZER, FIELD_MANAGER)
            .await
    }

    async fn list_endpoints(&self) -> Result<Vec<AIMEndpoint>, Error> {
        let api: Api<AIMEndpoint> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_pvc(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        let namespace = pvc.namespace().ok_or_else(|| {
            Error::internal_with_context("create_pvc", "claim without a namespace")
        })?;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.create(&params, pvc).await?)
    }

    async fn patch_pvc(
        &self,
        name: &str,
        namespace: &str,
        patch: &serde_json::Value,
    ) -> Result<PersistentVolumeClaim, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?)
    }
}

/// Controller context for the AIMCache controller
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

/// Reconcile an AIMCache
#[instrument(skip(cache, ctx), fields(cache = %cache.name_any()))]
pub async fn reconcile(cache: Arc<AIMCache>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = cache.name_any();
    let namespace = cache
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "AIMCache must be namespaced"))?;
    debug!("reconciling cache");

    if is_being_deleted(cache.as_ref()) {
        return handle_deletion(&cache, &name, &namespace, &ctx).await;
    }

    if !has_finalizer(cache.as_ref(), CACHE_FINALIZER) {
        info!("Adding finalizer");
        ctx.kube.add_finalizer(&name, &namespace).await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    let pvc = ensure_pvc(&cache, &ctx).await?;
    let endpoints = ctx.kube.list_endpoints().await?;
    let index = UsageIndex::build(&endpoints);

    let status = compute_status(&cache, &namespace, Some(&pvc), &index, Utc::now())?;
    update_status(&cache, &name, &namespace, &ctx, status).await?;

    Ok(Action::requeue(READY_REQUEUE))
}

/// Create the claim when absent; otherwise bring its mutable fields in line
async fn ensure_pvc(cache: &AIMCache, ctx: &Context) -> Result<PersistentVolumeClaim, Error> {
    let desired = build_cache_pvc(cache)?;
    let pvc_name = desired.name_any();
    let namespace = desired.namespace().unwrap_or_default();

    let Some(existing) = ctx.kube.get_pvc(&pvc_name, &namespace).await? else {
        info!(pvc = %pvc_name, "Creating cache storage claim");
        return ctx.kube.create_pvc(&desired).await;
    };

    if is_shrink(&existing, &desired) {
        warn!(
            pvc = %pvc_name,
            requested = %cache.spec.storage.size,
            "Cache storage claims cannot shrink, keeping current size"
        );
    }
    if needs_update(&existing, &desired) {
        info!(pvc = %pvc_name, "Updating cache storage claim");
        let patch = mutable_fields_patch(&existing, &desired);
        return ctx.kube.patch_pvc(&pvc_name, &namespace, &patch).await;
    }
    Ok(existing)
}

/// Derive the full Ready status: storage, inventory, usage and cleanup
fn compute_status(
    cache: &AIMCache,
    namespace: &str,
    pvc: Option<&PersistentVolumeClaim>,
    index: &UsageIndex,
    now: DateTime<Utc>,
) -> Result<AIMCacheStatus, Error> {
    let previous = cache.status.clone().unwrap_or_default();

    let mut entries =
        reconcile_inventory(&cache.spec, &previous.cached_models, namespace, index, now);
    let mut usage = cache_usage(&entries, previous.usage.as_ref(), now);

    if let Some(policy) = cache.spec.cleanup.as_ref().filter(|c| c.enabled) {
        if is_due(previous.usage.as_ref(), now) {
            let capacity = parse_quantity_bytes(&cache.spec.storage.size)?;
            match run_cleanup(policy, &cache.spec.models, &mut entries, capacity, now) {
                Ok(outcome) => {
                    info!(
                        evicted = outcome.evicted(),
                        next = %outcome.next_cleanup,
                        "Cache cleanup completed"
                    );
                    usage = cache_usage(&entries, None, now);
                    usage.last_cleanup = Some(now);
                    usage.next_cleanup = Some(outcome.next_cleanup);
                }
                Err(e) => warn!(error = %e, "Cache cleanup failed"),
            }
        }
    }

    let condition = Condition::new(
        "Ready",
        ConditionStatus::True,
        "CacheReady",
        "AIMCache is ready",
    )
    .transition_from(&previous.conditions);

    Ok(AIMCacheStatus {
        phase: CachePhase::Ready,
        conditions: vec![condition],
        observed_generation: cache.metadata.generation,
        storage: storage_status(&cache.spec, pvc, &entries)?,
        cached_models: entries,
        usage: Some(usage),
    })
}

/// Hold or release the finalizer of a cache being deleted.
///
/// Any endpoint in the cluster with caching enabled holds the cache.
async fn handle_deletion(
    cache: &AIMCache,
    name: &str,
    namespace: &str,
    ctx: &Context,
) -> Result<Action, Error> {
    if !has_finalizer(cache, CACHE_FINALIZER) {
        return Ok(Action::await_change());
    }

    let endpoints = ctx.kube.list_endpoints().await?;
    let index = UsageIndex::build(&endpoints);
    let users = index.caching_endpoints();

    if !users.is_empty() {
        warn!(endpoints = users.len(), "Cache deletion blocked");
        let mut status = cache.status.clone().unwrap_or_default();
        let condition = Condition::new(
            "DeletionBlocked",
            ConditionStatus::True,
            "EndpointsStillUsing",
            format!(
                "Cannot delete cache: still in use by endpoints: {}",
                format_refs(&users)
            ),
        )
        .transition_from(&status.conditions);
        status.phase = CachePhase::DeletionBlocked;
        status.conditions = vec![condition];
        update_status(cache, name, namespace, ctx, status).await?;
        return Ok(Action::requeue(BLOCKED_REQUEUE));
    }

    info!("No endpoints use caching, removing finalizer");
    ctx.kube.remove_finalizer(name, namespace).await?;
    Ok(Action::await_change())
}

async fn update_status(
    cache: &AIMCache,
    name: &str,
    namespace: &str,
    ctx: &Context,
    status: AIMCacheStatus,
) -> Result<(), Error> {
    if cache.status.as_ref() == Some(&status) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }
    info!(phase = %status.phase, "Updating cache status");
    ctx.kube.patch_status(name, namespace, &status).await
}

/// Error policy for the AIMCache controller
///
/// Logs the error and requeues for retry after 30 seconds.
pub fn error_policy(cache: Arc<AIMCache>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cache = %cache.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(30))
}
