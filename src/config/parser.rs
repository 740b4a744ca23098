//! Configuration parser for loading and merging configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, HalldyllError, Result};
use std::path::Path;
use tracing::{debug, info, warn};

use super::spec::InfraConfig;

/// Configuration parser for loading infrastructure configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<InfraConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(HalldyllError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            HalldyllError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<InfraConfig> {
        debug!("Parsing YAML configuration");

        let config: InfraConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            HalldyllError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration for project {} ({} resources)",
            config.project.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Recognized variables: `HALLDYLL_STATE_BUCKET`, `HALLDYLL_STATE_PREFIX`,
    /// `HALLDYLL_STATE_PATH` and `HALLDYLL_CONCURRENCY`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<InfraConfig> {
        let mut config = self.load_file(path)?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                HalldyllError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Applies `HALLDYLL_*` overrides using the given variable lookup.
pub fn apply_env_overrides<F>(config: &mut InfraConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(bucket) = lookup("HALLDYLL_STATE_BUCKET") {
        debug!("Overriding state.bucket from environment");
        config.state.bucket = Some(bucket);
    }

    if let Some(prefix) = lookup("HALLDYLL_STATE_PREFIX") {
        debug!("Overriding state.prefix from environment");
        config.state.prefix = Some(prefix);
    }

    if let Some(path) = lookup("HALLDYLL_STATE_PATH") {
        debug!("Overriding state.path from environment");
        config.state.path = Some(path);
    }

    if let Some(raw) = lookup("HALLDYLL_CONCURRENCY") {
        match raw.parse::<usize>() {
            Ok(concurrency) => {
                debug!("Overriding engine.concurrency from environment");
                config.engine.concurrency = concurrency;
            }
            Err(e) => warn!("Ignoring invalid HALLDYLL_CONCURRENCY '{raw}': {e}"),
        }
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "halldyll.infra.yaml",
    "halldyll.infra.yml",
    "infra.yaml",
    "infra.yml",
];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(HalldyllError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateBackend;
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.engine.concurrency, 4);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: network
  environment: prod

state:
  backend: s3
  bucket: halldyll-state
  prefix: network/prod

engine:
  concurrency: 8
  retry:
    max_attempts: 3

providers:
  - name: aws
    endpoint: http://127.0.0.1:7070
    token_env: AWS_PLUGIN_TOKEN

resources:
  - type: aws_vpc
    name: main
    attributes:
      cidr_block: 10.0.0.0/16
      tags:
        Name: main
  - type: aws_subnet
    name: public_a
    attributes:
      vpc_id: "${aws_vpc.main.id}"
      cidr_block: 10.0.1.0/24
    depends_on:
      - aws_vpc.main
"#;
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "network");
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.engine.concurrency, 8);
        assert_eq!(config.engine.retry.max_attempts, 3);
        assert_eq!(config.engine.retry.base_delay_ms, 500);
        assert_eq!(config.providers[0].timeout_secs, 60);
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[1].depends_on, vec!["aws_vpc.main"]);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let parser = ConfigParser::new();
        let result = parser.parse_yaml("project: [", None);
        assert!(matches!(
            result,
            Err(HalldyllError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let parser = ConfigParser::new();
        let mut config = parser
            .parse_yaml("project:\n  name: test\n", None)
            .unwrap();

        let vars: HashMap<&str, &str> = [
            ("HALLDYLL_STATE_BUCKET", "override-bucket"),
            ("HALLDYLL_STATE_PATH", "/tmp/state"),
            ("HALLDYLL_CONCURRENCY", "16"),
        ]
        .into_iter()
        .collect();
        apply_env_overrides(&mut config, |key| vars.get(key).map(ToString::to_string));

        assert_eq!(config.state.bucket.as_deref(), Some("override-bucket"));
        assert_eq!(config.state.path.as_deref(), Some("/tmp/state"));
        assert_eq!(config.state.prefix, None);
        assert_eq!(config.engine.concurrency, 16);
    }

    #[test]
    fn test_invalid_concurrency_override_is_ignored() {
        let parser = ConfigParser::new();
        let mut config = parser
            .parse_yaml("project:\n  name: test\n", None)
            .unwrap();
        apply_env_overrides(&mut config, |key| {
            (key == "HALLDYLL_CONCURRENCY").then(|| String::from("many"))
        });
        assert_eq!(config.engine.concurrency, 4);
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("infra.yaml"), "project:\n  name: x\n").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("infra.yaml"));
    }
}
