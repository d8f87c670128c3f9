//! Task dependency graph and batch validation.

pub mod dependency;

pub use dependency::{DependencyGraph, DependencyReport, resolve_order, validate_dependencies};
