//! CLI command implementations.
//!
//! Each submodule implements one fixloop subcommand with pure formatting
//! separated from IO for testability.

pub mod backends;
pub mod clean;
pub mod run;
pub mod summarize;
