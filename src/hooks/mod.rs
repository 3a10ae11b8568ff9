//! Lifecycle hook orchestration
//!
//! Resolves, for each test, the ordered chain of Before/After actions at
//! Test, Class, Assembly and Session scope, including hooks inherited from
//! base classes and global ("every") hooks, and runs the chains with
//! symmetric bracketing guarantees.

mod chain;
mod runner;
mod scope;

pub use chain::HookRegistry;
pub use runner::{run_chain, ChainResult};
pub use scope::ScopeGates;

use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

use crate::cancellation::CancellationSignal;
use crate::error::HookError;
use crate::models::TestId;

/// The lifetime level a hook attaches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookScope {
    Test,
    Class,
    Assembly,
    Session,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Before,
    After,
}

/// Information handed to a hook when it runs.
#[derive(Clone)]
pub struct HookContext {
    /// Set for Test-scope hooks; scope-level (All) hooks run without a test.
    pub test_id: Option<TestId>,
    pub class_name: Option<String>,
    pub scope: HookScope,
    pub phase: HookPhase,
    pub cancellation: CancellationSignal,
}

pub type HookCallback =
    Arc<dyn Fn(HookContext) -> BoxFuture<'static, Result<(), HookError>> + Send + Sync>;

/// One registered hook action.
#[derive(Clone)]
pub struct HookAction {
    name: String,
    order: i32,
    callback: HookCallback,
}

impl HookAction {
    pub fn new(name: impl Into<String>, callback: HookCallback) -> Self {
        Self {
            name: name.into(),
            order: 0,
            callback,
        }
    }

    /// Declaration order; only meaningful for global ("every") hooks.
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Convenience wrapper for closures returning a boxed future.
    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(HookContext) -> BoxFuture<'static, Result<(), HookError>> + Send + Sync + 'static,
    {
        Self::new(name, Arc::new(f))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub async fn invoke(&self, ctx: HookContext) -> Result<(), HookError> {
        (self.callback)(ctx).await
    }
}

impl fmt::Debug for HookAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookAction")
            .field("name", &self.name)
            .field("order", &self.order)
            .finish()
    }
}
