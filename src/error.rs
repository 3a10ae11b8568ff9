//! Error types for the execution core
//!
//! Discovery-time errors abort the whole run before scheduling starts;
//! everything that happens after scheduling begins terminates in an
//! [`Outcome`](crate::models::Outcome) instead of an error.

use thiserror::Error;

/// Fatal errors raised while turning descriptors into an executable graph.
///
/// These are discovery-time failures: nothing is scheduled and no outcomes
/// are produced when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Test {test} declares a dependency on {reference}, which does not match any test")]
    UnresolvedDependency { test: String, reference: String },

    #[error("Circular dependency: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("Test {test} depends on itself")]
    SelfDependency { test: String },

    #[error("Serial lane {key} orders {test} after {blocker}, but {blocker} depends on {test}")]
    SerialOrderConflict {
        key: String,
        test: String,
        blocker: String,
    },

    #[error("Duplicate test id: {0}")]
    DuplicateTestId(String),

    #[error("Test {test} requires fixture {type_name}, but no factory is registered for it")]
    MissingFixtureFactory { test: String, type_name: String },
}

/// Error returned by user fixture code (`initialize`/`dispose`).
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct FixtureError(pub String);

impl FixtureError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Error returned by user hook code.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_renders_full_path() {
        let err = DiscoveryError::DependencyCycle {
            path: vec!["A::a".into(), "B::b".into(), "A::a".into()],
        };
        assert_eq!(err.to_string(), "Circular dependency: A::a -> B::b -> A::a");
    }

    #[test]
    fn test_unresolved_names_both_sides() {
        let err = DiscoveryError::UnresolvedDependency {
            test: "Suite::check".into(),
            reference: "Missing::dep".into(),
        };
        assert!(err.to_string().contains("Suite::check"));
        assert!(err.to_string().contains("Missing::dep"));
    }
}
