use clap::{Parser, Subcommand, ValueEnum};

use aim_endpoint::compiler::DEFAULT_IMAGE_REGISTRY;
use aim_endpoint::GpuFallbackPolicy;

/// AIM - Kubernetes operator for AMD Inference Microservices
#[derive(Parser, Debug)]
#[command(name = "aim-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        env = "AIM_LOG_FORMAT",
        default_value_t = LogFormat::Text,
        global = true,
    )]
    pub log_format: LogFormat,

    /// How an auto-selecting endpoint is matched to a recipe GPU configuration
    #[arg(
        long,
        env = "AIM_GPU_FALLBACK",
        default_value_t = GpuFallbackPolicy::ExactMatch,
        global = true,
    )]
    pub gpu_fallback: GpuFallbackPolicy,

    /// Monitoring integration for endpoints that enable monitoring
    #[arg(
        long,
        value_enum,
        env = "AIM_MONITORING",
        default_value_t = MonitoringMode::None,
        global = true,
    )]
    pub monitoring: MonitoringMode,

    /// Registry used for the default serving image
    #[arg(
        long,
        env = "AIM_IMAGE_REGISTRY",
        default_value = DEFAULT_IMAGE_REGISTRY,
        global = true,
    )]
    pub image_registry: String,

    /// Do not install or update the CRDs on startup
    #[arg(long, global = true)]
    pub skip_crd_install: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Operator subcommands
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the controllers (default mode)
    ///
    /// Watches AIMRecipe, AIMCache and AIMEndpoint resources in every
    /// namespace and reconciles them until a shutdown signal arrives.
    Controller,
}

/// Log output format
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Which monitoring integration the endpoint controller uses
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MonitoringMode {
    /// Monitoring settings are accepted but nothing is created
    #[default]
    None,
    /// Emit ServiceMonitor and PrometheusRule objects
    PrometheusOperator,
}

/// Settings the controllers are started with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// GPU fallback policy for automatic recipe selection
    pub gpu_fallback: GpuFallbackPolicy,
    /// Monitoring integration
    pub monitoring: MonitoringMode,
    /// Registry for the default serving image
    pub image_registry: String,
    /// Whether CRDs are applied on startup
    pub install_crds: bool,
}

impl From<&Cli> for OperatorConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            gpu_fallback: cli.gpu_fallback,
            monitoring: cli.monitoring,
            image_registry: cli.image_registry.trim_end_matches('/').to_string(),
            install_crds: !cli.skip_crd_install,
        }
    }
}
