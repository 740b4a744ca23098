//! CLI module for the Halldyll infrastructure engine.
//!
//! This module provides the command-line interface for planning,
//! applying, and inspecting infrastructure.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
