//! Shared-fixture lifecycle management
//!
//! Fixtures are lifecycle-managed resources shared across tests according
//! to a declared scope. The manager reference-counts consumers, initializes
//! each scope instance exactly once, and disposes it exactly once after the
//! last holder releases.

mod handle;
mod registry;

pub use handle::FixtureHandle;
pub use registry::FixtureManager;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::FixtureError;
use crate::models::{ClassMetadata, FailureCategory, TestFailure};

/// How widely one fixture instance is shared.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum FixtureScope {
    /// Fresh instance per acquire; never enters the shared registry.
    PerInvocation,
    /// One instance per declaring test class.
    PerClass,
    /// One instance per assembly.
    PerAssembly,
    /// One instance for the whole session.
    PerSession,
    /// Shared by every acquirer naming the same key, regardless of class
    /// or assembly, until session teardown.
    Keyed(String),
}

/// The sharing-window instance a shared fixture lives in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScopeWindow {
    Class(String),
    Assembly(String),
    Session,
    Keyed(String),
}

impl fmt::Display for ScopeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeWindow::Class(name) => write!(f, "class:{name}"),
            ScopeWindow::Assembly(name) => write!(f, "assembly:{name}"),
            ScopeWindow::Session => f.write_str("session"),
            ScopeWindow::Keyed(key) => write!(f, "key:{key}"),
        }
    }
}

/// Registry key: at most one live instance exists per distinct key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FixtureKey {
    pub type_name: String,
    pub window: ScopeWindow,
}

impl FixtureKey {
    pub fn new(type_name: impl Into<String>, window: ScopeWindow) -> Self {
        Self {
            type_name: type_name.into(),
            window,
        }
    }

    /// Registry key for a scope, or `None` for `PerInvocation`.
    pub fn for_scope(
        type_name: &str,
        scope: &FixtureScope,
        class: &ClassMetadata,
    ) -> Option<Self> {
        let window = match scope {
            FixtureScope::PerInvocation => return None,
            FixtureScope::PerClass => ScopeWindow::Class(class.name.clone()),
            FixtureScope::PerAssembly => ScopeWindow::Assembly(class.assembly.clone()),
            FixtureScope::PerSession => ScopeWindow::Session,
            FixtureScope::Keyed(key) => ScopeWindow::Keyed(key.clone()),
        };
        Some(Self::new(type_name, window))
    }
}

impl fmt::Display for FixtureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.type_name, self.window)
    }
}

/// A lifecycle-managed resource instance consumed by one or more tests.
///
/// Implementors downcast through [`Fixture::as_any`] from the handle a
/// [`crate::models::TestContext`] exposes.
#[async_trait]
pub trait Fixture: Send + Sync + 'static {
    async fn initialize(&self) -> Result<(), FixtureError> {
        Ok(())
    }

    async fn dispose(&self) -> Result<(), FixtureError> {
        Ok(())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

/// Produces an uninitialized fixture instance; the manager drives
/// `initialize`/`dispose`.
pub type FixtureFactory = Arc<dyn Fn() -> Arc<dyn Fixture> + Send + Sync>;

/// Failure raised by fixture creation or disposal, replayed to consumers
/// of the same key within its lifetime window.
#[derive(Clone, Debug, thiserror::Error)]
#[error("fixture {type_name}: {message}")]
pub struct FixtureFailure {
    pub type_name: String,
    pub category: FailureCategory,
    pub message: String,
}

impl FixtureFailure {
    pub fn setup(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            category: FailureCategory::Setup,
            message: message.into(),
        }
    }

    pub fn teardown(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            category: FailureCategory::Teardown,
            message: message.into(),
        }
    }

    pub fn to_test_failure(&self) -> TestFailure {
        TestFailure::new(self.category, format!("fixture {}: {}", self.type_name, self.message))
    }
}
