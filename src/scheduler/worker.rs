//! Single-unit execution pipeline
//!
//! Runs one scheduled test end to end: scope gates, fixture acquisition,
//! Before hooks, the spawned body (with timeout, cancellation and panic
//! containment), After hooks, and release in reverse order. The body is
//! spawned as its own task so a panic is caught at the join boundary
//! instead of taking the worker down.

use chrono::Utc;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cancellation::CancellationSignal;
use crate::fixture::{Fixture, FixtureHandle, FixtureManager};
use crate::hooks::{
    run_chain, ChainResult, HookAction, HookContext, HookPhase, HookRegistry, HookScope, ScopeGates,
};
use crate::models::{
    FailureCategory, Outcome, TestContext, TestDescriptor, TestFailure, TestReport,
};
use crate::utils::Timer;

/// Shared collaborators every worker needs.
pub(crate) struct ExecutionEnv {
    pub(crate) hooks: Arc<HookRegistry>,
    pub(crate) gates: ScopeGates,
    pub(crate) fixtures: Arc<FixtureManager>,
    pub(crate) cancel: CancellationSignal,
    pub(crate) default_timeout: Duration,
}

enum AttemptOutcome {
    Passed,
    Failed(TestFailure),
    TimedOut,
    Cancelled,
}

/// Run one unit to its terminal report. Infallible: every error path is
/// folded into the report's outcome or diagnostics.
pub(crate) async fn execute_unit(env: Arc<ExecutionEnv>, descriptor: Arc<TestDescriptor>) -> TestReport {
    let started_at = Utc::now();
    let timer = Timer::start();
    let timeout = descriptor.timeout.unwrap_or(env.default_timeout);

    let mut diagnostics = Vec::new();
    let mut attempts = 1;
    let outcome = run_pipeline(&env, &descriptor, timeout, &mut diagnostics, &mut attempts).await;

    for failure in env.gates.leave(&descriptor.class).await {
        diagnostics.push(failure.to_string());
    }

    let mut report = TestReport::new(descriptor.id.clone(), descriptor.display_name.clone(), outcome);
    report.duration_ms = timer.elapsed_ms();
    report.attempts = attempts;
    report.diagnostics = diagnostics;
    report.started_at = started_at;
    report.finished_at = Utc::now();
    debug!("{report}");
    report
}

async fn run_pipeline(
    env: &ExecutionEnv,
    descriptor: &Arc<TestDescriptor>,
    timeout: Duration,
    diagnostics: &mut Vec<String>,
    attempts: &mut u32,
) -> Outcome {
    if env.cancel.is_cancelled() {
        return Outcome::Cancelled;
    }

    if let Err(failure) = env.gates.enter(&descriptor.class).await {
        return Outcome::Failed(failure);
    }

    let handles = match env.fixtures.acquire_for(descriptor).await {
        Ok(handles) => handles,
        Err(failure) => return Outcome::Failed(failure.to_test_failure()),
    };
    let fixture_map: Arc<HashMap<String, Arc<dyn Fixture>>> = Arc::new(
        handles
            .iter()
            .map(|handle| (handle.type_name().to_string(), handle.instance().clone()))
            .collect(),
    );

    let before = env
        .hooks
        .resolve_chain(&descriptor.class, HookScope::Test, HookPhase::Before);
    let after = env
        .hooks
        .resolve_chain(&descriptor.class, HookScope::Test, HookPhase::After);

    let before_ctx = hook_ctx(env, descriptor, HookPhase::Before);
    let outcome = match run_chain(&before, &before_ctx, timeout, &env.cancel).await {
        ChainResult::Cancelled => {
            // Earlier Before hooks may have acquired state; the After
            // chain is still owed its cleanup shot.
            run_after(env, descriptor, &after, timeout, diagnostics).await;
            Outcome::Cancelled
        }
        ChainResult::Completed { failures } => match failures.into_iter().next() {
            Some(failure) => {
                // Setup failed: the body never runs, but After hooks still
                // get their cleanup shot.
                run_after(env, descriptor, &after, timeout, diagnostics).await;
                Outcome::Failed(failure)
            }
            None => {
                run_attempts(env, descriptor, &fixture_map, &after, timeout, diagnostics, attempts)
                    .await
            }
        },
    };

    release_fixtures(env, handles, diagnostics).await;
    outcome
}

/// Body + After loop, re-entered on retry. Before hooks and fixtures are
/// never re-run across attempts.
async fn run_attempts(
    env: &ExecutionEnv,
    descriptor: &Arc<TestDescriptor>,
    fixture_map: &Arc<HashMap<String, Arc<dyn Fixture>>>,
    after: &[HookAction],
    timeout: Duration,
    diagnostics: &mut Vec<String>,
    attempts: &mut u32,
) -> Outcome {
    let max_attempts = descriptor.retry.count + 1;
    let mut attempt = 1;

    loop {
        *attempts = attempt;
        let body_outcome = run_body(env, descriptor, fixture_map.clone(), attempt, timeout).await;
        let mut after_failures = run_after(env, descriptor, after, timeout, diagnostics).await;

        match body_outcome {
            AttemptOutcome::Failed(failure) => {
                if attempt < max_attempts
                    && descriptor.retry.accepts(&failure)
                    && !env.cancel.is_cancelled()
                {
                    warn!(test = %descriptor.id, attempt, %failure, "retrying failed test");
                    diagnostics.push(format!("attempt {attempt}: {failure}"));
                    attempt += 1;
                    continue;
                }
                return Outcome::Failed(failure);
            }
            AttemptOutcome::Passed => {
                // A teardown failure after a passing body fails the test;
                // it must not be masked by the pass.
                return if after_failures.is_empty() {
                    Outcome::Passed
                } else {
                    Outcome::Failed(after_failures.remove(0))
                };
            }
            AttemptOutcome::TimedOut => return Outcome::TimedOut,
            AttemptOutcome::Cancelled => return Outcome::Cancelled,
        }
    }
}

async fn run_body(
    env: &ExecutionEnv,
    descriptor: &Arc<TestDescriptor>,
    fixture_map: Arc<HashMap<String, Arc<dyn Fixture>>>,
    attempt: u32,
    timeout: Duration,
) -> AttemptOutcome {
    let ctx = TestContext::new(
        descriptor.id.clone(),
        descriptor.display_name.clone(),
        attempt,
        env.cancel.clone(),
        fixture_map,
    );
    let body = descriptor.body.clone();
    let mut handle = tokio::spawn(async move { (body)(ctx).await });

    let joined = tokio::select! {
        _ = env.cancel.cancelled() => {
            handle.abort();
            return AttemptOutcome::Cancelled;
        }
        joined = tokio::time::timeout(timeout, &mut handle) => joined,
    };

    match joined {
        Err(_elapsed) => {
            handle.abort();
            AttemptOutcome::TimedOut
        }
        Ok(Ok(Ok(()))) => AttemptOutcome::Passed,
        Ok(Ok(Err(body_error))) => {
            AttemptOutcome::Failed(TestFailure::new(body_error.category(), body_error.to_string()))
        }
        Ok(Err(join_error)) if join_error.is_panic() => {
            AttemptOutcome::Failed(panic_failure(join_error.into_panic()))
        }
        Ok(Err(_aborted)) => AttemptOutcome::Cancelled,
    }
}

/// After failures are returned for outcome promotion; every one is also
/// recorded as a diagnostic so none is lost when the body already failed.
async fn run_after(
    env: &ExecutionEnv,
    descriptor: &Arc<TestDescriptor>,
    after: &[HookAction],
    timeout: Duration,
    diagnostics: &mut Vec<String>,
) -> Vec<TestFailure> {
    let ctx = hook_ctx(env, descriptor, HookPhase::After);
    match run_chain(after, &ctx, timeout, &env.cancel).await {
        ChainResult::Completed { failures } => {
            for failure in &failures {
                diagnostics.push(failure.to_string());
            }
            failures
        }
        ChainResult::Cancelled => Vec::new(),
    }
}

async fn release_fixtures(
    env: &ExecutionEnv,
    handles: Vec<FixtureHandle>,
    diagnostics: &mut Vec<String>,
) {
    for handle in handles {
        if let Err(failure) = env.fixtures.release(handle).await {
            diagnostics.push(failure.to_string());
        }
    }
}

fn hook_ctx(env: &ExecutionEnv, descriptor: &TestDescriptor, phase: HookPhase) -> HookContext {
    HookContext {
        test_id: Some(descriptor.id.clone()),
        class_name: Some(descriptor.class.name.clone()),
        scope: HookScope::Test,
        phase,
        cancellation: env.cancel.clone(),
    }
}

fn panic_failure(payload: Box<dyn Any + Send>) -> TestFailure {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());

    // `Option::unwrap()` on None is the moral equivalent of a null
    // dereference and is categorized as one.
    let category = if message.contains("Option::unwrap()") || message.contains("Option::expect()") {
        FailureCategory::NullReference
    } else {
        FailureCategory::Unknown
    };
    TestFailure::new(category, format!("panicked: {message}"))
}
