//! Error types for the Halldyll infrastructure engine.
//!
//! This module provides the error hierarchy for every phase of a run:
//! configuration, graph construction, state management, provider calls,
//! planning, and apply.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Halldyll infrastructure engine.
#[derive(Debug, Error)]
pub enum HalldyllError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider plugin errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Resource graph construction errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Two resources share the same address.
    #[error("Duplicate resource address: {address}")]
    DuplicateResource {
        /// The duplicated address.
        address: String,
    },

    /// No provider is registered for the resource type.
    #[error("Resource {address} has unknown type '{resource_type}'")]
    UnknownResourceType {
        /// Address of the resource.
        address: String,
        /// The unregistered type.
        resource_type: String,
    },

    /// An attribute expression could not be parsed.
    #[error("Invalid expression in {resource}.{attribute}: {reason}")]
    InvalidExpression {
        /// Address of the resource holding the expression.
        resource: String,
        /// Attribute containing the expression.
        attribute: String,
        /// Why the expression is invalid.
        reason: String,
    },

    /// A reference points to a missing resource or attribute.
    #[error("Unresolved reference in {resource}: {reference} ({reason})")]
    UnresolvedReference {
        /// Address of the referencing resource.
        resource: String,
        /// The reference text.
        reference: String,
        /// Why it could not be resolved.
        reason: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency detected: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// Resources participating in the cycle, in cycle order.
        cycle: Vec<String>,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another invocation.
    #[error("State is locked by another process (lock holder: {holder}, since: {since}); retry later")]
    Locked {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The state lock expired or was taken over while a run held it.
    #[error("State lock {lock_id} was lost while the run was in progress")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// Stale write-ahead markers were found.
    #[error(
        "Operations of unknown outcome found for: {}; run `reconcile` before planning",
        .resources.join(", ")
    )]
    ReconciliationRequired {
        /// Resources with stale markers.
        resources: Vec<String>,
    },

    /// Local filesystem backend error.
    #[error("Local state backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: u32,
        /// Found state version.
        found: u32,
    },
}

/// Errors reported by resource providers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The operation timed out; it may or may not have taken effect.
    #[error("Provider operation timed out: {message}")]
    Timeout {
        /// Description of the timeout.
        message: String,
    },

    /// The provider asked the caller to slow down.
    #[error("Provider rate limited the request: {message}")]
    RateLimited {
        /// Seconds to wait before retrying, if the provider said so.
        retry_after_secs: Option<u64>,
        /// Description from the provider.
        message: String,
    },

    /// The provider accepted the request but failed while serving it.
    #[error("Provider unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// The request never reached the provider.
    #[error("Provider unreachable: {message}")]
    Unreachable {
        /// Description of the connection failure.
        message: String,
    },

    /// The provider rejected the request as invalid.
    #[error("Provider rejected the request: {message}")]
    Validation {
        /// Description from the provider.
        message: String,
    },

    /// The caller is not allowed to perform the operation.
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// Description from the provider.
        message: String,
    },

    /// The operation conflicts with existing provider-side state.
    #[error("Conflict: {message}")]
    Conflict {
        /// Description from the provider.
        message: String,
    },

    /// The remote object does not exist.
    #[error("Resource not found: {id}")]
    NotFound {
        /// Provider identifier that was not found.
        id: String,
    },

    /// The provider returned something the engine cannot understand.
    #[error("Invalid provider response: {message}")]
    Protocol {
        /// Description of the response issue.
        message: String,
    },

    /// No provider is registered for a resource type.
    #[error("No provider registered for resource type '{resource_type}'")]
    NotRegistered {
        /// The resource type.
        resource_type: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Ordering constraints cannot be satisfied.
    #[error("Schedule deadlock: no valid order for steps {}", .steps.join(", "))]
    ScheduleDeadlock {
        /// Steps that could not be ordered.
        steps: Vec<String>,
    },

    /// The stored state changed since the plan was computed.
    #[error("Plan is stale: computed against state serial {planned}, store is at {current}; re-plan")]
    StalePlan {
        /// Serial the plan was computed against.
        planned: u64,
        /// Serial currently in the store.
        current: u64,
    },

    /// Something the planner needed was missing.
    #[error("Failed to build plan: {message}")]
    Incomplete {
        /// Description of the issue.
        message: String,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Some steps failed or were not attempted.
    #[error("Apply incomplete: {completed} completed, {failed} failed, {not_attempted} not attempted")]
    Partial {
        /// Number of completed steps.
        completed: usize,
        /// Number of failed steps.
        failed: usize,
        /// Number of steps never started.
        not_attempted: usize,
    },

    /// The apply was cancelled before all steps ran.
    #[error("Apply cancelled: {completed} completed, {not_attempted} not attempted")]
    Cancelled {
        /// Number of completed steps.
        completed: usize,
        /// Number of steps never started.
        not_attempted: usize,
    },
}

/// Result type alias for Halldyll operations.
pub type Result<T> = std::result::Result<T, HalldyllError>;

impl HalldyllError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates an unreachable error.
    #[must_use]
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns true for errors worth retrying with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::Unavailable { .. }
                | Self::Unreachable { .. }
        )
    }

    /// Returns true when the remote side may have applied the operation anyway.
    ///
    /// Only rejections the provider answered explicitly, and requests that
    /// never left the client, are known to have had no effect.
    #[must_use]
    pub const fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Unavailable { .. } | Self::Protocol { .. }
        )
    }

    /// Returns the provider-requested delay before retrying, if any.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}
