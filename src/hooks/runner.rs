//! Hook chain execution
//!
//! Runs resolved chains under the owning test's cancellation token and
//! effective timeout. Before chains stop at the first failure (the body is
//! never entered) and yield to cancellation between and during actions.
//! After chains are cleanup: they run every action and collect every
//! failure, and a fired cancellation token does not interrupt them, only
//! the per-action timeout bounds them.

use std::time::Duration;
use tracing::{debug, warn};

use crate::cancellation::CancellationSignal;
use crate::models::{FailureCategory, TestFailure};

use super::{HookAction, HookContext, HookPhase};

/// Result of running one hook chain.
#[derive(Clone, Debug)]
pub enum ChainResult {
    /// Every action was attempted (Before: until the first failure).
    Completed { failures: Vec<TestFailure> },
    /// Cancellation fired before the chain finished.
    Cancelled,
}

impl ChainResult {
    pub fn first_failure(&self) -> Option<&TestFailure> {
        match self {
            ChainResult::Completed { failures } => failures.first(),
            ChainResult::Cancelled => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, ChainResult::Completed { failures } if failures.is_empty())
    }
}

/// Run a resolved chain in order.
///
/// A hook that does not observe cancellation within `timeout` is forcibly
/// abandoned and recorded as a Timeout-categorized failure.
pub async fn run_chain(
    chain: &[HookAction],
    ctx: &HookContext,
    timeout: Duration,
    cancel: &CancellationSignal,
) -> ChainResult {
    let failure_category = match ctx.phase {
        HookPhase::Before => FailureCategory::Setup,
        HookPhase::After => FailureCategory::Teardown,
    };
    // Only Before chains race cancellation; After chains are the cleanup
    // a cancelled test is still owed.
    let interruptible = ctx.phase == HookPhase::Before;

    let mut failures = Vec::new();
    for action in chain {
        if interruptible && cancel.is_cancelled() {
            return ChainResult::Cancelled;
        }
        debug!(hook = action.name(), phase = ?ctx.phase, scope = ?ctx.scope, "running hook");

        let invocation = tokio::time::timeout(timeout, action.invoke(ctx.clone()));
        let outcome = if interruptible {
            tokio::select! {
                _ = cancel.cancelled() => return ChainResult::Cancelled,
                result = invocation => result,
            }
        } else {
            invocation.await
        };

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(TestFailure::new(
                failure_category,
                format!("hook {}: {}", action.name(), e),
            )),
            Err(_elapsed) => Some(TestFailure::new(
                FailureCategory::Timeout,
                format!(
                    "hook {} did not complete within {}s",
                    action.name(),
                    timeout.as_secs()
                ),
            )),
        };

        if let Some(failure) = failure {
            warn!(hook = action.name(), %failure, "hook failed");
            failures.push(failure);
            if ctx.phase == HookPhase::Before {
                break;
            }
        }
    }

    ChainResult::Completed { failures }
}
