//! The provider capability interface.
//!
//! A provider owns one resource type. The engine never interprets resource
//! semantics itself; it only moves attribute maps through this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::ProviderError;

/// Concrete attribute values of a resource.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// How a resource is replaced when an immutable attribute changes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePolicy {
    /// Destroy the old instance, then create the new one.
    #[default]
    DestroyBeforeCreate,
    /// Create the new instance, re-point dependents, then destroy the old one.
    CreateBeforeDestroy,
}

impl std::fmt::Display for ReplacePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DestroyBeforeCreate => write!(f, "destroy-before-create"),
            Self::CreateBeforeDestroy => write!(f, "create-before-destroy"),
        }
    }
}

/// Schema a provider declares for its resource type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSchema {
    /// Resource type tag served by the provider.
    pub resource_type: String,
    /// Attributes whose change forces replacement.
    #[serde(default)]
    pub immutable_attributes: BTreeSet<String>,
    /// Attributes assigned by the provider.
    #[serde(default)]
    pub computed_attributes: BTreeSet<String>,
    /// Default replacement policy.
    #[serde(default)]
    pub replace_policy: ReplacePolicy,
}

impl ResourceSchema {
    /// Creates a schema with no immutable or computed attributes.
    #[must_use]
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Self::default()
        }
    }

    /// Marks attributes as immutable.
    #[must_use]
    pub fn with_immutable<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.immutable_attributes
            .extend(attributes.into_iter().map(Into::into));
        self
    }

    /// Marks attributes as provider-computed.
    #[must_use]
    pub fn with_computed<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.computed_attributes
            .extend(attributes.into_iter().map(Into::into));
        self
    }

    /// Sets the default replacement policy.
    #[must_use]
    pub const fn with_replace_policy(mut self, policy: ReplacePolicy) -> Self {
        self.replace_policy = policy;
        self
    }

    /// Returns true if changing the attribute forces replacement.
    #[must_use]
    pub fn is_immutable(&self, attribute: &str) -> bool {
        self.immutable_attributes.contains(attribute)
    }

    /// Returns true if the attribute is provider-assigned.
    ///
    /// The provider identifier (`id`) is always computed.
    #[must_use]
    pub fn is_computed(&self, attribute: &str) -> bool {
        attribute == "id" || self.computed_attributes.contains(attribute)
    }
}

/// Per-operation context handed to providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    /// Address of the resource being operated on.
    pub address: String,
    /// Idempotency token; identical for every retry of one operation.
    pub token: String,
}

impl OperationContext {
    /// Creates a context with a fresh idempotency token.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Creates a context reusing an existing token.
    #[must_use]
    pub fn with_token(address: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: token.into(),
        }
    }
}

/// A remote object as reported by a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteObject {
    /// Provider-assigned identifier.
    pub id: String,
    /// Concrete attributes, including computed ones.
    #[serde(default)]
    pub attributes: Attributes,
}

/// Capability interface for one resource type.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the schema of the served resource type.
    fn schema(&self) -> &ResourceSchema;

    /// Creates a remote object.
    async fn create(
        &self,
        ctx: &OperationContext,
        attributes: &Attributes,
    ) -> ProviderResult<RemoteObject>;

    /// Reads a remote object; `None` when it no longer exists.
    async fn read(&self, ctx: &OperationContext, id: &str) -> ProviderResult<Option<Attributes>>;

    /// Updates mutable attributes in place.
    async fn update(
        &self,
        ctx: &OperationContext,
        id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<Attributes>;

    /// Deletes a remote object.
    async fn delete(&self, ctx: &OperationContext, id: &str) -> ProviderResult<()>;

    /// Looks up an object created with the context's idempotency token.
    ///
    /// Providers that cannot search by token return `None`.
    async fn find(&self, ctx: &OperationContext) -> ProviderResult<Option<RemoteObject>> {
        let _ = ctx;
        Ok(None)
    }
}
