//! AIMRecipe CRD types
//!
//! An `AIMRecipe` describes how to serve one model on one accelerator
//! platform: the numeric precision, the serving backend and the GPU-count
//! configurations known to work. Endpoints select a recipe either
//! automatically (by model id) or by pinning one by name.
//!
//! The enum-like fields (`hardware`, `precision`, `backend`) are plain strings
//! on the wire so an unrecognised value still deserializes and is reported
//! through `status` as `Invalid` rather than breaking the watch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::Error;

/// Smallest GPU count a configuration may request
pub const MIN_GPU_COUNT: i32 = 1;

/// Largest GPU count a configuration may request (one full node)
pub const MAX_GPU_COUNT: i32 = 8;

// =============================================================================
// Enumerated attributes
// =============================================================================

/// Supported AMD Instinct accelerator platforms
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HardwarePlatform {
    /// Instinct MI300X
    Mi300x,
    /// Instinct MI325X
    Mi325x,
    /// Instinct MI355X
    Mi355x,
    /// Instinct MI250
    Mi250,
    /// Instinct MI210
    Mi210,
}

impl HardwarePlatform {
    /// All recognised platforms, in documentation order
    pub const ALL: [HardwarePlatform; 5] = [
        Self::Mi300x,
        Self::Mi325x,
        Self::Mi355x,
        Self::Mi250,
        Self::Mi210,
    ];
}

impl std::str::FromStr for HardwarePlatform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.to_string() == s)
            .ok_or_else(|| Error::validation(format!("invalid hardware platform: {s}")))
    }
}

impl std::fmt::Display for HardwarePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mi300x => write!(f, "MI300X"),
            Self::Mi325x => write!(f, "MI325X"),
            Self::Mi355x => write!(f, "MI355X"),
            Self::Mi250 => write!(f, "MI250"),
            Self::Mi210 => write!(f, "MI210"),
        }
    }
}

/// Numeric precision the model weights are served at
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precision {
    /// bfloat16
    Bfloat16,
    /// IEEE half precision
    Float16,
    /// FP8
    Float8,
    /// 8-bit integer quantisation
    Int8,
    /// 4-bit integer quantisation
    Int4,
}

impl Precision {
    /// All recognised precisions
    pub const ALL: [Precision; 5] = [
        Self::Bfloat16,
        Self::Float16,
        Self::Float8,
        Self::Int8,
        Self::Int4,
    ];
}

impl std::str::FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.to_string() == s)
            .ok_or_else(|| Error::validation(format!("invalid precision: {s}")))
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bfloat16 => write!(f, "bfloat16"),
            Self::Float16 => write!(f, "float16"),
            Self::Float8 => write!(f, "float8"),
            Self::Int8 => write!(f, "int8"),
            Self::Int4 => write!(f, "int4"),
        }
    }
}

/// Serving engine running inside the inference container
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// vLLM
    Vllm,
    /// SGLang
    Sglang,
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vllm" => Ok(Self::Vllm),
            "sglang" => Ok(Self::Sglang),
            _ => Err(Error::validation(format!("invalid backend: {s}"))),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vllm => write!(f, "vllm"),
            Self::Sglang => write!(f, "sglang"),
        }
    }
}

// =============================================================================
// AIMRecipe CRD
// =============================================================================

/// Configuration template for serving one model on one hardware platform
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "aim.engine.amd.com",
    version = "v1alpha1",
    kind = "AIMRecipe",
    plural = "aimrecipes",
    shortname = "aimr",
    namespaced,
    status = "AIMRecipeStatus",
    printcolumn = r#"{"name":"Model","type":"string","jsonPath":".spec.modelId"}"#,
    printcolumn = r#"{"name":"Hardware","type":"string","jsonPath":".spec.hardware"}"#,
    printcolumn = r#"{"name":"Precision","type":"string","jsonPath":".spec.precision"}"#,
    printcolumn = r#"{"name":"Backend","type":"string","jsonPath":".spec.backend"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AIMRecipeSpec {
    /// Model identifier this recipe serves (e.g. "meta-llama/Llama-3.1-8B-Instruct")
    pub model_id: String,

    /// Accelerator platform (MI300X, MI325X, MI355X, MI250, MI210)
    pub hardware: String,

    /// Numeric precision (bfloat16, float16, float8, int8, int4)
    pub precision: String,

    /// Serving backend (vllm, sglang)
    pub backend: String,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// GPU-count configurations known to work for this model
    #[serde(default)]
    pub configurations: Vec<GpuConfiguration>,

    /// Expected performance characteristics (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceSpec>,
}

/// One GPU-count configuration of a recipe
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GpuConfiguration {
    /// Number of GPUs (1-8)
    pub gpu_count: i32,

    /// Whether this configuration may be selected
    #[serde(default)]
    pub enabled: bool,

    /// Arguments passed through to the serving process
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,

    /// Extra environment for the serving process
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Suggested CPU/memory sizing for this configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ConfigurationResources>,
}

/// CPU/memory sizing hint for a configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationResources {
    /// CPU quantity (e.g. "16")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory quantity (e.g. "128Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Expected performance of the recipe
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSpec {
    /// Expected generation throughput
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_tokens_per_second: Option<i32>,
    /// Expected request latency in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_latency_ms: Option<i32>,
    /// Maximum batch size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<i32>,
}

impl AIMRecipeSpec {
    /// Validate the recipe structure.
    ///
    /// Checks run in a fixed order and the first failure is returned:
    /// hardware, precision, backend, configuration presence, per-configuration
    /// GPU range, at least one enabled configuration.
    pub fn validate(&self) -> Result<(), Error> {
        self.hardware.parse::<HardwarePlatform>()?;
        self.precision.parse::<Precision>()?;
        self.backend.parse::<Backend>()?;

        if self.configurations.is_empty() {
            return Err(Error::validation_for_field(
                &self.model_id,
                "spec.configurations",
                "at least one GPU configuration is required",
            ));
        }

        for (i, config) in self.configurations.iter().enumerate() {
            if !(MIN_GPU_COUNT..=MAX_GPU_COUNT).contains(&config.gpu_count) {
                return Err(Error::validation_for_field(
                    &self.model_id,
                    format!("spec.configurations[{i}].gpuCount"),
                    format!(
                        "configuration {i}: GPU count must be between {MIN_GPU_COUNT} and {MAX_GPU_COUNT}"
                    ),
                ));
            }
        }

        if !self.configurations.iter().any(|c| c.enabled) {
            return Err(Error::validation_for_field(
                &self.model_id,
                "spec.configurations",
                "at least one GPU configuration must be enabled",
            ));
        }

        Ok(())
    }

    /// Find the enabled configuration with exactly `gpu_count` GPUs
    pub fn enabled_configuration(&self, gpu_count: i32) -> Option<&GpuConfiguration> {
        self.configurations
            .iter()
            .find(|c| c.enabled && c.gpu_count == gpu_count)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Phase of an AIMRecipe
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RecipePhase {
    /// Not yet validated
    #[default]
    Pending,
    /// Valid and selectable
    Ready,
    /// Failed validation; never selectable
    Invalid,
    /// Deletion requested but endpoints still reference the recipe
    DeletionBlocked,
}

impl std::fmt::Display for RecipePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Ready => write!(f, "Ready"),
            Self::Invalid => write!(f, "Invalid"),
            Self::DeletionBlocked => write!(f, "DeletionBlocked"),
        }
    }
}

/// Status of an AIMRecipe
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AIMRecipeStatus {
    /// Current phase
    #[serde(default)]
    pub phase: RecipePhase,

    /// Conditions explaining the phase
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation most recently validated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Usage computed from referencing endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<RecipeUsage>,
}

/// How many endpoints use a recipe, and when it was last picked up
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecipeUsage {
    /// Number of endpoints whose selected recipe is this one
    #[serde(default)]
    pub endpoint_count: i32,

    /// Creation time of the most recent referencing endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}
