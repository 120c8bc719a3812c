//! Endpoint status read back from the live workload

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use aim_common::crd::{
    AIMEndpoint, AIMEndpointStatus, Condition, ConditionStatus, EndpointAddresses,
    EndpointPhase, ReplicaCounts, SelectedRecipe,
};
use aim_common::SERVER_PORT;

use crate::compiler::HTTP_PORT_NAME;

/// Status of a reconciled endpoint.
///
/// Ready once at least one replica passes readiness; Pending otherwise,
/// including when the Deployment has not been observed yet.
pub fn workload_status(
    endpoint: &AIMEndpoint,
    selected: Option<SelectedRecipe>,
    deployment: Option<&Deployment>,
    service: Option<&Service>,
    previous: &[Condition],
) -> AIMEndpointStatus {
    let replicas = deployment.map(replica_counts);
    let ready = replicas.as_ref().is_some_and(|r| r.ready > 0);

    let (phase, condition) = if ready {
        (
            EndpointPhase::Ready,
            Condition::new(
                "Ready",
                ConditionStatus::True,
                "DeploymentReady",
                "AIMEndpoint is ready",
            ),
        )
    } else {
        (
            EndpointPhase::Pending,
            Condition::new(
                "Ready",
                ConditionStatus::False,
                "DeploymentNotReady",
                "Deployment is not ready",
            ),
        )
    };

    AIMEndpointStatus {
        phase: Some(phase),
        conditions: vec![condition.transition_from(previous)],
        observed_generation: endpoint.metadata.generation,
        selected_recipe: selected,
        replicas,
        endpoints: service.map(addresses),
    }
}

/// Replica counts published by a Deployment
pub fn replica_counts(deployment: &Deployment) -> ReplicaCounts {
    let status = deployment.status.as_ref();
    ReplicaCounts {
        current: status.and_then(|s| s.replicas).unwrap_or(0),
        desired: deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0),
        ready: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        available: status.and_then(|s| s.available_replicas).unwrap_or(0),
    }
}

/// Addresses at which a Service is reachable
pub fn addresses(service: &Service) -> EndpointAddresses {
    let spec = service.spec.as_ref();
    let port = spec
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| {
            ports
                .iter()
                .find(|p| p.name.as_deref() == Some(HTTP_PORT_NAME))
                .or_else(|| ports.first())
        })
        .map_or(SERVER_PORT, |p| p.port);
    let internal = format!(
        "{}.{}.svc.cluster.local:{port}",
        service.name_any(),
        service.namespace().unwrap_or_default()
    );

    let is_load_balancer = spec.and_then(|s| s.type_.as_deref()) == Some("LoadBalancer");
    let ingress = is_load_balancer
        .then(|| {
            service
                .status
                .as_ref()?
                .load_balancer
                .as_ref()?
                .ingress
                .as_ref()?
                .first()
                .and_then(|i| i.ip.clone().or_else(|| i.hostname.clone()))
        })
        .flatten();

    EndpointAddresses {
        internal: Some(internal),
        external: ingress.clone(),
        load_balancer: ingress,
    }
}
