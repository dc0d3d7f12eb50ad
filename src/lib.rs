//! Cli/daemon that tracks browsing behavior reported by a browser through
//! native messaging, keeps per-site time budgets, and talks to an optional
//! companion backend.
//!

pub mod cli;
pub mod engine;
pub mod utils;
