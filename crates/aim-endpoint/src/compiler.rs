//! Compilation of an AIMEndpoint into Kubernetes resources
//!
//! The compiler is pure: the same endpoint and recipe snapshot always yield
//! the same objects, so the controller can server-side apply the output on
//! every reconcile without drift. Every object carries the standard label set
//! and a controller owner reference to the endpoint.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HPAScalingRules, HorizontalPodAutoscaler,
    HorizontalPodAutoscalerBehavior, HorizontalPodAutoscalerSpec, MetricSpec, MetricTarget,
    ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, ContainerPort, EnvVar, LocalObjectReference, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec,
    PodTemplateSpec, ResourceRequirements, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use aim_common::crd::{AIMEndpoint, AIMEndpointSpec, SelectedRecipe, DEFAULT_ACCESS_MODE};
use aim_common::kube_utils::{controller_owner_ref, selector_labels, standard_labels};
use aim_common::{Error, AMD_GPU_RESOURCE, SERVER_PORT};

/// `app.kubernetes.io/name` of objects owned by endpoints
pub const ENDPOINT_APP_NAME: &str = "aim-endpoint";

/// Component label of the model ConfigMap
pub const CONFIG_COMPONENT: &str = "config";
/// Component label of the cache claim
pub const CACHE_COMPONENT: &str = "cache";
/// Component label of the Deployment
pub const SERVER_COMPONENT: &str = "server";
/// Component label of the Service
pub const SERVICE_COMPONENT: &str = "service";
/// Component label of the HorizontalPodAutoscaler
pub const AUTOSCALER_COMPONENT: &str = "autoscaler";

/// Name of the serving container
pub const CONTAINER_NAME: &str = "aim-server";
/// Name of the HTTP port on the container and Service
pub const HTTP_PORT_NAME: &str = "http";
/// Name of the cache volume
pub const CACHE_VOLUME_NAME: &str = "model-cache";
/// Where the cache volume is mounted in the serving container
pub const CACHE_MOUNT_PATH: &str = "/workspace/model-cache";

/// Registry hosting the conventional `<backend>-server` images
pub const DEFAULT_IMAGE_REGISTRY: &str = "ghcr.io/aim-engine";
/// Tag used when an image repository is given without one
pub const DEFAULT_IMAGE_TAG: &str = "latest";
/// Backend assumed before a recipe is resolved
pub const DEFAULT_BACKEND: &str = "vllm";

/// Environment pointing model hubs and the serving engine at the cache volume
const CACHE_ENV_VARS: [&str; 4] = [
    "HF_HOME",
    "TRANSFORMERS_CACHE",
    "HF_DATASETS_CACHE",
    "VLLM_CACHE_DIR",
];

/// Name of an endpoint's model ConfigMap
pub fn config_map_name(endpoint: &str) -> String {
    format!("{endpoint}-config")
}

/// Name of an endpoint's cache claim
pub fn cache_claim_name(endpoint: &str) -> String {
    format!("{endpoint}-cache")
}

/// Every Kubernetes object derived from one endpoint
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledEndpoint {
    /// Model and recipe metadata
    pub config_map: ConfigMap,
    /// Cache claim, present only when caching is enabled
    pub cache_pvc: Option<PersistentVolumeClaim>,
    /// Serving workload
    pub deployment: Deployment,
    /// In-cluster (and optionally external) exposure
    pub service: Service,
    /// Autoscaler, present only when `maxReplicas > 1`
    pub hpa: Option<HorizontalPodAutoscaler>,
}

/// Compiles endpoints into their child resources
#[derive(Clone, Debug)]
pub struct EndpointCompiler {
    image_registry: String,
}

impl Default for EndpointCompiler {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_REGISTRY)
    }
}

/// Shared naming for one compilation pass
struct Target<'a> {
    name: String,
    namespace: String,
    owner: OwnerReference,
    spec: &'a AIMEndpointSpec,
}

impl Target<'_> {
    fn metadata(&self, name: String, component: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(standard_labels(ENDPOINT_APP_NAME, &self.name, component)),
            owner_references: Some(vec![self.owner.clone()]),
            ..Default::default()
        }
    }

    fn selector(&self) -> BTreeMap<String, String> {
        selector_labels(ENDPOINT_APP_NAME, &self.name)
    }
}

impl EndpointCompiler {
    /// Create a compiler resolving conventional images against `image_registry`
    pub fn new(image_registry: impl Into<String>) -> Self {
        Self {
            image_registry: image_registry.into(),
        }
    }

    /// Compile `endpoint` with the resolved recipe snapshot, if any
    pub fn compile(
        &self,
        endpoint: &AIMEndpoint,
        selected: Option<&SelectedRecipe>,
    ) -> Result<CompiledEndpoint, Error> {
        let name = endpoint.name_any();
        let namespace = endpoint
            .namespace()
            .ok_or_else(|| Error::validation_for(&name, "AIMEndpoint must be namespaced"))?;
        let target = Target {
            owner: controller_owner_ref(endpoint)?,
            name,
            namespace,
            spec: &endpoint.spec,
        };

        Ok(CompiledEndpoint {
            config_map: compile_config_map(&target, selected),
            cache_pvc: target
                .spec
                .cache_enabled()
                .then(|| compile_cache_pvc(&target)),
            deployment: self.compile_deployment(&target, selected),
            service: compile_service(&target),
            hpa: target
                .spec
                .autoscaling_enabled()
                .then(|| compile_hpa(&target)),
        })
    }

    /// Serving image: the explicit repository, else the backend's conventional image
    pub fn image(&self, spec: &AIMEndpointSpec, selected: Option<&SelectedRecipe>) -> String {
        match &spec.image.repository {
            Some(repository) => {
                let tag = spec.image.tag.as_deref().unwrap_or(DEFAULT_IMAGE_TAG);
                format!("{repository}:{tag}")
            }
            None => {
                let backend = selected.map_or(DEFAULT_BACKEND, |s| s.backend.as_str());
                format!("{}/{backend}-server:latest", self.image_registry)
            }
        }
    }

    fn compile_deployment(
        &self,
        target: &Target<'_>,
        selected: Option<&SelectedRecipe>,
    ) -> Deployment {
        let spec = target.spec;
        let cache = spec.cache_enabled();

        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(self.image(spec, selected)),
            image_pull_policy: spec.image.pull_policy.clone(),
            ports: Some(vec![ContainerPort {
                name: Some(HTTP_PORT_NAME.to_string()),
                container_port: SERVER_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            resources: container_resources(spec, selected),
            env: Some(container_env(spec, selected)),
            volume_mounts: cache.then(|| {
                vec![VolumeMount {
                    name: CACHE_VOLUME_NAME.to_string(),
                    mount_path: CACHE_MOUNT_PATH.to_string(),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        };

        let volumes = cache.then(|| {
            vec![Volume {
                name: CACHE_VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: cache_claim_name(&target.name),
                    read_only: None,
                }),
                ..Default::default()
            }]
        });

        let security = &spec.security;
        let pod_security_context = security.pod_security_context.as_ref().map(|ctx| {
            PodSecurityContext {
                run_as_user: ctx.run_as_user,
                run_as_group: ctx.run_as_group,
                fs_group: ctx.fs_group,
                ..Default::default()
            }
        });
        let pull_secrets = (!spec.image.pull_secrets.is_empty()).then(|| {
            spec.image
                .pull_secrets
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect()
        });

        Deployment {
            metadata: target.metadata(target.name.clone(), SERVER_COMPONENT),
            spec: Some(DeploymentSpec {
                // The autoscaler owns the replica count once it exists
                replicas: (!spec.autoscaling_enabled()).then(|| spec.min_replicas()),
                selector: LabelSelector {
                    match_labels: Some(target.selector()),
                    ..Default::default()
                },
                strategy: compile_strategy(spec),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(target.selector()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes,
                        service_account_name: security.service_account_name.clone(),
                        security_context: pod_security_context,
                        image_pull_secrets: pull_secrets,
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn compile_config_map(target: &Target<'_>, selected: Option<&SelectedRecipe>) -> ConfigMap {
    let model = &target.spec.model;
    let mut data = BTreeMap::from([
        ("model.id".to_string(), model.id.clone()),
        (
            "model.version".to_string(),
            model.version.clone().unwrap_or_default(),
        ),
        (
            "model.revision".to_string(),
            model.revision.clone().unwrap_or_default(),
        ),
    ]);
    if let Some(recipe) = selected {
        data.insert("recipe.name".to_string(), recipe.name.clone());
        data.insert("recipe.precision".to_string(), recipe.precision.clone());
        data.insert("recipe.backend".to_string(), recipe.backend.clone());
    }

    ConfigMap {
        metadata: target.metadata(config_map_name(&target.name), CONFIG_COMPONENT),
        data: Some(data),
        ..Default::default()
    }
}

fn compile_cache_pvc(target: &Target<'_>) -> PersistentVolumeClaim {
    let cache = &target.spec.cache;
    PersistentVolumeClaim {
        metadata: target.metadata(cache_claim_name(&target.name), CACHE_COMPONENT),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![cache
                .access_mode
                .clone()
                .unwrap_or_else(|| DEFAULT_ACCESS_MODE.to_string())]),
            storage_class_name: cache.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(target.spec.cache_size().to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn compile_service(target: &Target<'_>) -> Service {
    let exposure = &target.spec.service;
    let mut metadata = target.metadata(target.name.clone(), SERVICE_COMPONENT);
    if !exposure.annotations.is_empty() {
        metadata.annotations = Some(exposure.annotations.clone());
    }

    Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(target.selector()),
            ports: Some(vec![ServicePort {
                name: Some(HTTP_PORT_NAME.to_string()),
                port: service_port(target.spec),
                target_port: Some(IntOrString::Int(SERVER_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: exposure.type_.clone(),
            load_balancer_ip: exposure.load_balancer_ip.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Port the endpoint's Service exposes
pub fn service_port(spec: &AIMEndpointSpec) -> i32 {
    spec.service.port.unwrap_or(SERVER_PORT)
}

fn compile_hpa(target: &Target<'_>) -> HorizontalPodAutoscaler {
    let scaling = &target.spec.scaling;

    let utilization = |resource: &str, percent: i32| MetricSpec {
        type_: "Resource".to_string(),
        resource: Some(ResourceMetricSource {
            name: resource.to_string(),
            target: MetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: Some(percent),
                ..Default::default()
            },
        }),
        ..Default::default()
    };
    let metrics: Vec<MetricSpec> = [
        scaling.target_cpu_utilization.map(|p| utilization("cpu", p)),
        scaling
            .target_memory_utilization
            .map(|p| utilization("memory", p)),
    ]
    .into_iter()
    .flatten()
    .collect();

    let window = |seconds: Option<i32>| {
        seconds.map(|s| HPAScalingRules {
            stabilization_window_seconds: Some(s),
            ..Default::default()
        })
    };
    let behavior = (scaling.scale_up_delay.is_some() || scaling.scale_down_delay.is_some())
        .then(|| HorizontalPodAutoscalerBehavior {
            scale_up: window(scaling.scale_up_delay),
            scale_down: window(scaling.scale_down_delay),
        });

    HorizontalPodAutoscaler {
        metadata: target.metadata(target.name.clone(), AUTOSCALER_COMPONENT),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: target.name.clone(),
            },
            min_replicas: Some(target.spec.min_replicas()),
            max_replicas: scaling.max_replicas.unwrap_or(1),
            metrics: (!metrics.is_empty()).then_some(metrics),
            behavior,
        }),
        ..Default::default()
    }
}

fn compile_strategy(spec: &AIMEndpointSpec) -> Option<DeploymentStrategy> {
    let strategy = spec.deployment.strategy.as_ref()?;
    let type_ = strategy
        .type_
        .clone()
        .unwrap_or_else(|| "RollingUpdate".to_string());
    let rolling_update = if type_ == "RollingUpdate" {
        strategy
            .rolling_update
            .as_ref()
            .map(|ru| RollingUpdateDeployment {
                max_surge: ru.max_surge.map(IntOrString::Int),
                max_unavailable: ru.max_unavailable.map(IntOrString::Int),
            })
    } else {
        None
    };
    Some(DeploymentStrategy {
        type_: Some(type_),
        rolling_update,
    })
}

fn container_resources(
    spec: &AIMEndpointSpec,
    selected: Option<&SelectedRecipe>,
) -> Option<ResourceRequirements> {
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();

    let gpus = selected
        .and_then(|s| s.gpu_count)
        .or(spec.resources.gpu_count)
        .or(spec.recipe.gpu_count);
    if let Some(gpus) = gpus {
        requests.insert(AMD_GPU_RESOURCE.to_string(), Quantity(gpus.to_string()));
        limits.insert(AMD_GPU_RESOURCE.to_string(), Quantity(gpus.to_string()));
    }

    let r = &spec.resources;
    for (key, value) in [("cpu", &r.cpu), ("memory", &r.memory)] {
        if let Some(v) = value {
            requests.insert(key.to_string(), Quantity(v.clone()));
        }
    }
    for (key, value) in [("cpu", &r.cpu_limit), ("memory", &r.memory_limit)] {
        if let Some(v) = value {
            limits.insert(key.to_string(), Quantity(v.clone()));
        }
    }

    if requests.is_empty() && limits.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: (!requests.is_empty()).then_some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..Default::default()
    })
}

fn container_env(spec: &AIMEndpointSpec, selected: Option<&SelectedRecipe>) -> Vec<EnvVar> {
    let var = |name: &str, value: &str| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    };

    let mut env = vec![var("MODEL_ID", &spec.model.id)];
    if let Some(version) = &spec.model.version {
        env.push(var("MODEL_VERSION", version));
    }
    if let Some(recipe) = selected {
        env.push(var("PRECISION", &recipe.precision));
        env.push(var("BACKEND", &recipe.backend));
    }
    if spec.cache_enabled() {
        env.extend(CACHE_ENV_VARS.iter().map(|name| var(name, CACHE_MOUNT_PATH)));
        env.push(var("HF_HUB_DISABLE_TELEMETRY", "1"));
    }
    env
}
