//! Configuration types for the infrastructure engine.
//!
//! This module defines all the structs that map to the `halldyll.infra.yaml` file.
//! The document already expresses the resolved resource graph: each resource
//! names its type, its attributes, and whole-value references to other resources.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The root configuration structure for a Halldyll infrastructure project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InfraConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Execution engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Provider plugins serving resource types.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Desired resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Execution engine configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of provider operations in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retry policy for transient provider errors.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay of the exponential backoff in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound of a single backoff delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Provider plugin configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Provider name, used in logs and errors.
    pub name: String,
    /// Base URL of the plugin's HTTP endpoint.
    pub endpoint: String,
    /// Environment variable holding the bearer token (optional).
    #[serde(default)]
    pub token_env: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

/// A single desired resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource type tag (e.g., `aws_vpc`).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource name, unique within its type.
    pub name: String,
    /// Attribute values; strings of the form `${type.name.attr}` are references.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    /// Explicit ordering hints, as resource addresses.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lifecycle overrides.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl ResourceConfig {
    /// Returns the resource address (`type.name`).
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }
}

/// Lifecycle overrides for a resource.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Forces (or disables) create-before-destroy replacement.
    #[serde(default)]
    pub create_before_destroy: Option<bool>,
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}

const fn default_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_provider_timeout() -> u64 {
    60
}
