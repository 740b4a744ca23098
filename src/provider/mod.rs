//! Resource providers.
//!
//! This module contains:
//! - The `Provider` capability trait and its wire types
//! - The registry looking providers up by resource type tag
//! - The HTTP plugin client
//! - An in-memory provider

mod http;
mod memory;
mod registry;
mod traits;

pub use http::{HttpProvider, PluginClient, classify_status, connect_plugins};
pub use memory::{Journal, JournalEntry, MemoryProvider, Operation};
pub use registry::ProviderRegistry;
pub use traits::{
    Attributes, OperationContext, Provider, ProviderResult, RemoteObject, ReplacePolicy,
    ResourceSchema,
};

#[cfg(test)]
pub use traits::MockProvider;
