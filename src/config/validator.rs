//! Configuration validation for infrastructure documents.
//!
//! This module validates everything that can be checked without talking to a
//! provider: names, backends, engine tuning, and the shape of resource
//! declarations. Graph-level checks (references, cycles) live in the graph
//! builder.

use crate::error::{ConfigError, HalldyllError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    EngineConfig, InfraConfig, ProjectConfig, ProviderConfig, ResourceConfig, StateBackend,
    StateConfig,
};

/// Validator for infrastructure configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates an infrastructure configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first problem if validation fails.
    pub fn validate(&self, config: &InfraConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(HalldyllError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &InfraConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_engine(&config.engine, &mut result);
        Self::validate_providers(&config.providers, &mut result);
        Self::validate_resources(&config.resources, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
            }
            StateBackend::Local => {
                if state.path.as_ref().is_some_and(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.path"),
                        message: String::from("Local state path cannot be empty"),
                    });
                }
            }
        }
    }

    /// Validates engine tuning.
    fn validate_engine(engine: &EngineConfig, result: &mut ValidationResult) {
        if engine.concurrency == 0 {
            result.errors.push(ValidationError {
                field: String::from("engine.concurrency"),
                message: String::from("Concurrency must be at least 1"),
            });
        }

        if engine.retry.max_attempts == 0 {
            result.errors.push(ValidationError {
                field: String::from("engine.retry.max_attempts"),
                message: String::from("At least one attempt is required"),
            });
        }

        if engine.retry.base_delay_ms > engine.retry.max_delay_ms {
            result.errors.push(ValidationError {
                field: String::from("engine.retry.base_delay_ms"),
                message: format!(
                    "Base delay ({}ms) exceeds max delay ({}ms)",
                    engine.retry.base_delay_ms, engine.retry.max_delay_ms
                ),
            });
        }
    }

    /// Validates provider plugin declarations.
    fn validate_providers(providers: &[ProviderConfig], result: &mut ValidationResult) {
        let mut seen_names = HashSet::new();

        for (i, provider) in providers.iter().enumerate() {
            let prefix = format!("providers[{i}]");

            if !seen_names.insert(provider.name.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate provider name: {}", provider.name),
                });
            }

            if !is_valid_name(&provider.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!(
                        "Provider name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        provider.name
                    ),
                });
            }

            if !(provider.endpoint.starts_with("http://")
                || provider.endpoint.starts_with("https://"))
            {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.endpoint"),
                    message: format!(
                        "Endpoint '{}' must be an http:// or https:// URL",
                        provider.endpoint
                    ),
                });
            }

            if provider.timeout_secs == 0 {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.timeout_secs"),
                    message: String::from("Timeout must be at least 1 second"),
                });
            }

            if provider.token_env.as_ref().is_some_and(String::is_empty) {
                result.warnings.push(format!(
                    "{prefix}.token_env is empty; requests will be sent without a token"
                ));
            }
        }
    }

    /// Validates resource declarations.
    fn validate_resources(resources: &[ResourceConfig], result: &mut ValidationResult) {
        if resources.is_empty() {
            result.warnings.push(String::from("No resources defined in configuration"));
            return;
        }

        let mut seen_addresses = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !is_valid_identifier(&resource.resource_type) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.type"),
                    message: format!(
                        "Resource type '{}' is invalid. Must be lowercase alphanumeric with underscores.",
                        resource.resource_type
                    ),
                });
            }

            if !is_valid_identifier(&resource.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with underscores.",
                        resource.name
                    ),
                });
            }

            let address = resource.address();
            if !seen_addresses.insert(address.clone()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate resource: {address}"),
                });
            }

            for (j, hint) in resource.depends_on.iter().enumerate() {
                if !is_valid_address(hint) {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.depends_on[{j}]"),
                        message: format!("'{hint}' is not a resource address (type.name)"),
                    });
                }
            }

            if resource.attributes.is_empty() {
                result.warnings.push(format!("{address} has no attributes"));
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let mut chars = name.chars();

    // First character must be a letter
    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase()
    {
        return false;
    }

    // Rest must be lowercase alphanumeric or hyphen
    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return false;
        }
    }

    // Cannot end with hyphen
    if name.ends_with('-') {
        return false;
    }

    // Cannot have consecutive hyphens
    !name.contains("--")
}

/// Validates a resource type or resource name.
/// Identifiers start with a letter or underscore, followed by lowercase
/// alphanumerics, underscores, or hyphens.
pub fn is_valid_identifier(ident: &str) -> bool {
    let mut chars = ident.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Validates a `type.name` resource address.
pub fn is_valid_address(address: &str) -> bool {
    address
        .split_once('.')
        .is_some_and(|(ty, name)| is_valid_identifier(ty) && is_valid_identifier(name))
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> InfraConfig {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("network"));
        assert!(is_valid_name("core-net-01"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Network")); // uppercase
        assert!(!is_valid_name("1net")); // starts with number
        assert!(!is_valid_name("net-")); // ends with hyphen
        assert!(!is_valid_name("net--a")); // consecutive hyphens
    }

    #[test]
    fn test_identifiers_and_addresses() {
        assert!(is_valid_identifier("aws_vpc"));
        assert!(is_valid_identifier("public_a"));
        assert!(is_valid_identifier("_private"));
        assert!(!is_valid_identifier("Vpc"));
        assert!(!is_valid_identifier("9lives"));
        assert!(!is_valid_identifier(""));

        assert!(is_valid_address("aws_vpc.main"));
        assert!(!is_valid_address("aws_vpc"));
        assert!(!is_valid_address("aws_vpc.main.id"));
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let config = parse(
            r"
project:
  name: net
resources:
  - type: aws_vpc
    name: main
    attributes: { cidr_block: 10.0.0.0/16 }
  - type: aws_vpc
    name: main
    attributes: { cidr_block: 10.1.0.0/16 }
",
        );
        let result = ConfigValidator::new().check(&config);
        assert_eq!(result.error_count(), 1);
        assert!(result.errors[0].message.contains("aws_vpc.main"));
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_s3_requires_bucket() {
        let config = parse("project:\n  name: net\nstate:\n  backend: s3\n");
        let result = ConfigValidator::new().check(&config);
        assert!(result.errors.iter().any(|e| e.field == "state.bucket"));
    }

    #[test]
    fn test_engine_and_provider_checks() {
        let config = parse(
            r"
project:
  name: net
engine:
  concurrency: 0
  retry:
    base_delay_ms: 5000
    max_delay_ms: 100
providers:
  - name: aws
    endpoint: ftp://nope
resources:
  - type: aws_vpc
    name: main
    depends_on: [not-an-address]
",
        );
        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"engine.concurrency"));
        assert!(fields.contains(&"engine.retry.base_delay_ms"));
        assert!(fields.contains(&"providers[0].endpoint"));
        assert!(fields.contains(&"resources[0].depends_on[0]"));
        assert_eq!(result.warning_count(), 1);
    }

    #[test]
    fn test_empty_resources_warns() {
        let config = parse("project:\n  name: net\n");
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);
    }
}
