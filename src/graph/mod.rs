//! Dependency graph builder
//!
//! Validates and resolves declared test dependencies into an acyclic graph
//! the scheduler can walk.

mod builder;

pub use builder::{DependencyEdge, ExecutionGraph, GraphNode};
