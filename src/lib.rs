// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halldyll Infra
//!
//! A declarative, idempotent infrastructure reconciliation engine with
//! pluggable resource providers.
//!
//! ## Overview
//!
//! Halldyll reads a declarative description of resources and moves the real
//! world toward it:
//!
//! - Resources reference each other's attributes; references become graph edges
//! - Plans are computed against recorded state and never touch providers
//! - Applies run independent steps in parallel and commit each step atomically
//! - Interrupted runs leave write-ahead markers that `reconcile` resolves
//!
//! ## Architecture
//!
//! 1. **Desired State**: Defined in `halldyll.infra.yaml`
//! 2. **Recorded State**: Persisted by a state store (local file or S3)
//! 3. **Planner**: Diffs the two and schedules ordered steps
//! 4. **Executor**: Applies steps through providers registered by type
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing and validation
//! - [`graph`]: Attribute expressions and the resource graph
//! - [`state`]: State storage backends (local, S3), markers, and locking
//! - [`provider`]: Provider trait, registry, and HTTP plugins
//! - [`planner`]: Diff, scheduling, and apply
//! - [`engine`]: Facade over planning, apply, reconciliation, and drift
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: network
//!   environment: prod
//!
//! providers:
//!   - name: aws
//!     endpoint: http://localhost:9000
//!
//! resources:
//!   - type: aws_vpc
//!     name: main
//!     attributes:
//!       cidr_block: 10.0.0.0/16
//!   - type: aws_subnet
//!     name: a
//!     attributes:
//!       vpc_id: ${aws_vpc.main.id}
//!       cidr_block: 10.0.1.0/24
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, InfraConfig};
pub use engine::{DriftReport, Engine, EngineOptions, ReconcileReport};
pub use error::{HalldyllError, Result};
pub use graph::{GraphBuilder, ResourceGraph};
pub use planner::{ApplyExecutor, ApplyReport, DiffEngine, Plan, PlanScheduler};
pub use provider::{HttpProvider, MemoryProvider, Provider, ProviderRegistry};
pub use state::{LocalStateStore, S3StateStore, StateSnapshot, StateStore};
