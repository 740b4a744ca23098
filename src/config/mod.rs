//! Configuration module for the Halldyll infrastructure engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `halldyll.infra.yaml`
//! - Validation of configuration values
//! - Computing resource fingerprints for change tracking

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    EngineConfig, InfraConfig, LifecycleConfig, ProjectConfig, ProviderConfig, ResourceConfig,
    RetryConfig, StateBackend, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, apply_env_overrides, find_config_file};
pub use validator::{
    ConfigValidator, ValidationError, ValidationResult, is_valid_address, is_valid_identifier,
};
pub use hash::ConfigHasher;
