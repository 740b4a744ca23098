//! Provider lookup by resource type tag.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::ProviderError;

use super::traits::{Provider, ProviderResult, ResourceSchema};

/// Registry mapping resource type tags to providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    /// Providers keyed by the resource type they serve.
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            providers: BTreeMap::new(),
        }
    }

    /// Registers a provider under the type tag declared by its schema.
    ///
    /// A later registration for the same type replaces the earlier one.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let resource_type = provider.schema().resource_type.clone();
        debug!("Registering provider for {resource_type}");
        self.providers.insert(resource_type, provider);
    }

    /// Registers a provider, builder style.
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    /// Looks up the provider for a resource type.
    ///
    /// # Errors
    ///
    /// Returns `NotRegistered` if no provider serves the type.
    pub fn get(&self, resource_type: &str) -> ProviderResult<Arc<dyn Provider>> {
        self.providers
            .get(resource_type)
            .cloned()
            .ok_or_else(|| ProviderError::NotRegistered {
                resource_type: resource_type.to_string(),
            })
    }

    /// Returns the schema for a resource type, if registered.
    #[must_use]
    pub fn schema(&self, resource_type: &str) -> Option<&ResourceSchema> {
        self.providers.get(resource_type).map(|p| p.schema())
    }

    /// Returns true if a provider serves the type.
    #[must_use]
    pub fn contains(&self, resource_type: &str) -> bool {
        self.providers.contains_key(resource_type)
    }

    /// Returns the registered type tags in sorted order.
    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Returns the number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("resource_types", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;

    #[test]
    fn test_register_and_lookup() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(MemoryProvider::new(ResourceSchema::new("aws_vpc"))))
            .with(Arc::new(MemoryProvider::new(ResourceSchema::new("aws_subnet"))));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("aws_vpc"));
        assert_eq!(
            registry.resource_types().collect::<Vec<_>>(),
            vec!["aws_subnet", "aws_vpc"]
        );
        assert!(registry.get("aws_vpc").is_ok());
        assert_eq!(
            registry.schema("aws_subnet").map(|s| s.resource_type.as_str()),
            Some("aws_subnet")
        );
    }

    #[test]
    fn test_unknown_type() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get("aws_vpc"),
            Err(ProviderError::NotRegistered { resource_type }) if resource_type == "aws_vpc"
        ));
    }
}
