//! Resource graph module.
//!
//! This module contains:
//! - Attribute expressions and references
//! - The graph builder producing a validated DAG

mod builder;
mod expr;

pub use builder::{DependencyEdge, EdgeKind, GraphBuilder, ResourceGraph, ResourceSpec};
pub use expr::{Expr, Reference, Resolved};
