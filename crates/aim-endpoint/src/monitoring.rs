//! Monitoring integration for endpoints
//!
//! The controller calls a [`MonitoringHook`] for every endpoint with
//! `monitoring.enabled`. [`NoopMonitoring`] ignores the call;
//! [`PrometheusMonitoring`] emits a `ServiceMonitor` scraping the serving port
//! and a `PrometheusRule` with availability alerts, each only when the
//! Prometheus Operator CRD is installed.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::{ApiResource, Discovery};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use aim_common::crd::AIMEndpoint;
use aim_common::kube_utils::{controller_owner_ref, selector_labels, standard_labels};
use aim_common::Error;

use crate::compiler::{ENDPOINT_APP_NAME, HTTP_PORT_NAME};

/// Field manager for monitoring objects
const FIELD_MANAGER: &str = "aim-endpoint-monitoring";

/// Component label of monitoring objects
pub const MONITORING_COMPONENT: &str = "monitoring";

const PROMETHEUS_GROUP: &str = "monitoring.coreos.com";
const DEFAULT_SCRAPE_INTERVAL: &str = "30s";
const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Capability invoked for endpoints with monitoring enabled
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MonitoringHook: Send + Sync {
    /// Ensure monitoring objects exist for a reconciled endpoint
    async fn ensure(&self, endpoint: &AIMEndpoint) -> Result<(), Error>;
}

/// Monitoring hook that does nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMonitoring;

#[async_trait]
impl MonitoringHook for NoopMonitoring {
    async fn ensure(&self, endpoint: &AIMEndpoint) -> Result<(), Error> {
        debug!(endpoint = %endpoint.name_any(), "monitoring hook disabled, skipping");
        Ok(())
    }
}

/// Prometheus Operator resources available in the cluster
#[derive(Clone, Debug, Default)]
pub struct PrometheusCrds {
    /// `ServiceMonitor`, when installed
    pub service_monitor: Option<ApiResource>,
    /// `PrometheusRule`, when installed
    pub prometheus_rule: Option<ApiResource>,
}

impl PrometheusCrds {
    /// Discover installed Prometheus Operator CRDs.
    ///
    /// Missing CRDs result in `None` (not an error). If discovery itself fails
    /// the well-known `monitoring.coreos.com/v1` resources are assumed.
    pub async fn discover(client: &Client) -> Self {
        let discovery = match Discovery::new(client.clone()).run().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "API discovery failed, assuming monitoring.coreos.com/v1");
                return Self::hardcoded_defaults();
            }
        };
        Self {
            service_monitor: find_resource(&discovery, "ServiceMonitor"),
            prometheus_rule: find_resource(&discovery, "PrometheusRule"),
        }
    }

    /// The `monitoring.coreos.com/v1` resources
    pub fn hardcoded_defaults() -> Self {
        Self {
            service_monitor: Some(prometheus_resource("ServiceMonitor", "servicemonitors")),
            prometheus_rule: Some(prometheus_resource("PrometheusRule", "prometheusrules")),
        }
    }
}

fn find_resource(discovery: &Discovery, kind: &str) -> Option<ApiResource> {
    for group in discovery.groups() {
        if group.name() != PROMETHEUS_GROUP {
            continue;
        }
        for (ar, _caps) in group.resources_by_stability() {
            if ar.kind == kind {
                info!(kind = %kind, api_version = %ar.api_version, "discovered CRD version");
                return Some(ar);
            }
        }
    }
    warn!(group = PROMETHEUS_GROUP, kind = %kind, "CRD not found in API discovery");
    None
}

fn prometheus_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: PROMETHEUS_GROUP.to_string(),
        version: "v1".to_string(),
        api_version: format!("{PROMETHEUS_GROUP}/v1"),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

/// A dynamically-typed monitoring object ready to apply
#[derive(Clone, Debug)]
pub struct MonitoringObject {
    /// Object name
    pub name: String,
    /// Full object body
    pub json: serde_json::Value,
    /// Resource to apply it through
    pub api_resource: ApiResource,
}

/// Build the monitoring objects of an endpoint for the installed CRDs
pub fn build_monitoring_objects(
    endpoint: &AIMEndpoint,
    crds: &PrometheusCrds,
) -> Result<Vec<MonitoringObject>, Error> {
    let name = endpoint.name_any();
    let namespace = endpoint
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "AIMEndpoint must be namespaced"))?;
    let metadata = |object_name: &str| -> Result<serde_json::Value, Error> {
        Ok(serde_json::json!({
            "name": object_name,
            "namespace": namespace,
            "labels": standard_labels(ENDPOINT_APP_NAME, &name, MONITORING_COMPONENT),
            "ownerReferences": [controller_owner_ref(endpoint)?],
        }))
    };

    let mut objects = Vec::new();

    let prometheus = endpoint.spec.monitoring.prometheus.as_ref();
    let scrape = prometheus.and_then(|p| p.enabled).unwrap_or(true);
    if let (true, Some(ar)) = (scrape, &crds.service_monitor) {
        let monitor_name = format!("{name}-monitor");
        let interval = prometheus
            .and_then(|p| p.interval.as_deref())
            .unwrap_or(DEFAULT_SCRAPE_INTERVAL);
        let path = prometheus
            .and_then(|p| p.path.as_deref())
            .unwrap_or(DEFAULT_METRICS_PATH);
        objects.push(MonitoringObject {
            json: serde_json::json!({
                "apiVersion": ar.api_version,
                "kind": "ServiceMonitor",
                "metadata": metadata(&monitor_name)?,
                "spec": {
                    "selector": {"matchLabels": selector_labels(ENDPOINT_APP_NAME, &name)},
                    "endpoints": [{
                        "port": HTTP_PORT_NAME,
                        "path": path,
                        "interval": interval,
                    }],
                },
            }),
            name: monitor_name,
            api_resource: ar.clone(),
        });
    }

    if let Some(ar) = &crds.prometheus_rule {
        let rule_name = format!("{name}-alerts");
        let selector = format!("namespace=\"{namespace}\",deployment=\"{name}\"");
        objects.push(MonitoringObject {
            json: serde_json::json!({
                "apiVersion": ar.api_version,
                "kind": "PrometheusRule",
                "metadata": metadata(&rule_name)?,
                "spec": {
                    "groups": [{
                        "name": format!("aim-endpoint.{name}"),
                        "rules": [
                            {
                                "alert": "AIMEndpointUnavailable",
                                "expr": format!(
                                    "kube_deployment_status_replicas_available{{{selector}}} == 0"
                                ),
                                "for": "5m",
                                "labels": {"severity": "critical"},
                                "annotations": {
                                    "summary": format!(
                                        "AIMEndpoint {namespace}/{name} has no available replicas"
                                    ),
                                },
                            },
                            {
                                "alert": "AIMEndpointDegraded",
                                "expr": format!(
                                    "kube_deployment_status_replicas_available{{{selector}}} \
                                     < kube_deployment_spec_replicas{{{selector}}}"
                                ),
                                "for": "15m",
                                "labels": {"severity": "warning"},
                                "annotations": {
                                    "summary": format!(
                                        "AIMEndpoint {namespace}/{name} is degraded"
                                    ),
                                },
                            },
                        ],
                    }],
                },
            }),
            name: rule_name,
            api_resource: ar.clone(),
        });
    }

    Ok(objects)
}

/// Prometheus Operator monitoring hook
pub struct PrometheusMonitoring {
    client: Client,
    crds: PrometheusCrds,
}

impl PrometheusMonitoring {
    /// Create a hook applying through the given resources
    pub fn new(client: Client, crds: PrometheusCrds) -> Self {
        Self { client, crds }
    }

    /// Create a hook after discovering which Prometheus Operator CRDs exist
    pub async fn discover(client: Client) -> Self {
        let crds = PrometheusCrds::discover(&client).await;
        Self::new(client, crds)
    }
}

#[async_trait]
impl MonitoringHook for PrometheusMonitoring {
    async fn ensure(&self, endpoint: &AIMEndpoint) -> Result<(), Error> {
        let namespace = endpoint.namespace().unwrap_or_default();
        let params = PatchParams::apply(FIELD_MANAGER).force();
        for object in build_monitoring_objects(endpoint, &self.crds)? {
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), &namespace, &object.api_resource);
            debug!(
                name = %object.name,
                kind = %object.api_resource.kind,
                "applying monitoring object"
            );
            api.patch(&object.name, &params, &Patch::Apply(&object.json))
                .await?;
        }
        Ok(())
    }
}
