//! Configuration hashing for change detection.
//!
//! This module provides deterministic fingerprints of resource declarations.
//! A fingerprint is stored with each applied resource so later runs can tell
//! which declaration produced it.

use sha2::{Digest, Sha256};

use super::spec::ResourceConfig;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the fingerprint of a single resource declaration.
    ///
    /// Attribute maps are ordered, so the JSON encoding is canonical.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.resource_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(resource.name.as_bytes());
        hasher.update([0u8]);

        for (key, value) in &resource.attributes {
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }

        let mut hints: Vec<_> = resource.depends_on.iter().collect();
        hints.sort();
        for hint in hints {
            hasher.update(hint.as_bytes());
        }

        match resource.lifecycle.create_before_destroy {
            Some(true) => hasher.update([1u8]),
            Some(false) => hasher.update([2u8]),
            None => hasher.update([0u8]),
        }

        hex::encode(hasher.finalize())
    }

    /// Returns a short version of a hash for display.
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        hash.get(..12).unwrap_or(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecycleConfig;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn vpc(cidr: &str) -> ResourceConfig {
        ResourceConfig {
            resource_type: String::from("aws_vpc"),
            name: String::from("main"),
            attributes: BTreeMap::from([(String::from("cidr_block"), json!(cidr))]),
            depends_on: Vec::new(),
            lifecycle: LifecycleConfig::default(),
        }
    }

    #[test]
    fn test_resource_hash_deterministic() {
        let hasher = ConfigHasher::new();
        assert_eq!(
            hasher.hash_resource(&vpc("10.0.0.0/16")),
            hasher.hash_resource(&vpc("10.0.0.0/16"))
        );
        assert_eq!(hasher.hash_resource(&vpc("10.0.0.0/16")).len(), 64);
    }

    #[test]
    fn test_resource_hash_changes() {
        let hasher = ConfigHasher::new();
        let base = hasher.hash_resource(&vpc("10.0.0.0/16"));
        assert_ne!(base, hasher.hash_resource(&vpc("10.1.0.0/16")));

        let mut cbd = vpc("10.0.0.0/16");
        cbd.lifecycle.create_before_destroy = Some(true);
        assert_ne!(base, hasher.hash_resource(&cbd));
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(ConfigHasher::short_hash("abcdef0123456789"), "abcdef012345");
        assert_eq!(ConfigHasher::short_hash("abc"), "abc");
    }
}
