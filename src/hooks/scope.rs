//! Scope-instance gates for Before-All / After-All hooks
//!
//! The first test entering a class or assembly triggers its Before-All
//! chain exactly once (everyone else awaits the broadcast result, success
//! or failure); the last test leaving triggers After-All. Same once-only
//! discipline as shared fixtures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::cancellation::CancellationSignal;
use crate::models::{ClassMetadata, FailureCategory, TestDescriptor, TestFailure};

use super::{run_chain, ChainResult, HookContext, HookPhase, HookRegistry, HookScope};

struct Gate {
    /// Resolution metadata; assembly gates carry only the assembly name.
    meta: ClassMetadata,
    before: OnceCell<Result<(), TestFailure>>,
    /// Members that have not yet left the scope.
    remaining: AtomicUsize,
}

impl Gate {
    fn owner(&self) -> &str {
        if self.meta.name.is_empty() {
            &self.meta.assembly
        } else {
            &self.meta.name
        }
    }
}

/// Once-only Before-All/After-All gating for every class and assembly in a
/// session.
pub struct ScopeGates {
    hooks: Arc<HookRegistry>,
    cancel: CancellationSignal,
    hook_timeout: Duration,
    classes: HashMap<String, Gate>,
    assemblies: HashMap<String, Gate>,
}

impl ScopeGates {
    pub fn build<'a>(
        descriptors: impl Iterator<Item = &'a Arc<TestDescriptor>>,
        hooks: Arc<HookRegistry>,
        cancel: CancellationSignal,
        hook_timeout: Duration,
    ) -> Self {
        let mut classes: HashMap<String, Gate> = HashMap::new();
        let mut assemblies: HashMap<String, Gate> = HashMap::new();

        for descriptor in descriptors {
            let class = &descriptor.class;
            classes
                .entry(class.name.clone())
                .or_insert_with(|| Gate {
                    meta: class.clone(),
                    before: OnceCell::new(),
                    remaining: AtomicUsize::new(0),
                })
                .remaining
                .fetch_add(1, Ordering::SeqCst);
            assemblies
                .entry(class.assembly.clone())
                .or_insert_with(|| Gate {
                    meta: ClassMetadata::new("", class.assembly.clone()),
                    before: OnceCell::new(),
                    remaining: AtomicUsize::new(0),
                })
                .remaining
                .fetch_add(1, Ordering::SeqCst);
        }

        Self {
            hooks,
            cancel,
            hook_timeout,
            classes,
            assemblies,
        }
    }

    /// Enter both scope instances for a test, triggering Before-All chains
    /// on first entry. A chain failure is replayed to every member as a
    /// Setup failure.
    pub async fn enter(&self, class: &ClassMetadata) -> Result<(), TestFailure> {
        if let Some(gate) = self.assemblies.get(&class.assembly) {
            self.run_before_all(gate, HookScope::Assembly).await?;
        }
        if let Some(gate) = self.classes.get(&class.name) {
            self.run_before_all(gate, HookScope::Class).await?;
        }
        Ok(())
    }

    /// Leave both scope instances; the last member out runs the After-All
    /// chains, whose failures are returned for diagnostic attachment.
    pub async fn leave(&self, class: &ClassMetadata) -> Vec<TestFailure> {
        let mut failures = Vec::new();
        if let Some(gate) = self.classes.get(&class.name) {
            failures.extend(self.run_after_all(gate, HookScope::Class).await);
        }
        if let Some(gate) = self.assemblies.get(&class.assembly) {
            failures.extend(self.run_after_all(gate, HookScope::Assembly).await);
        }
        failures
    }

    async fn run_before_all(&self, gate: &Gate, scope: HookScope) -> Result<(), TestFailure> {
        gate.before
            .get_or_init(|| async {
                let chain = self.hooks.resolve_chain(&gate.meta, scope, HookPhase::Before);
                if chain.is_empty() {
                    return Ok(());
                }
                debug!(owner = %gate.owner(), ?scope, "running before-all chain");
                let ctx = self.context(gate, scope, HookPhase::Before);
                match run_chain(&chain, &ctx, self.hook_timeout, &self.cancel).await {
                    ChainResult::Completed { failures } => match failures.into_iter().next() {
                        None => Ok(()),
                        Some(failure) => Err(failure),
                    },
                    ChainResult::Cancelled => Err(TestFailure::new(
                        FailureCategory::Setup,
                        "cancelled during before-all",
                    )),
                }
            })
            .await
            .clone()
    }

    async fn run_after_all(&self, gate: &Gate, scope: HookScope) -> Vec<TestFailure> {
        if gate.remaining.fetch_sub(1, Ordering::SeqCst) != 1 {
            return Vec::new();
        }
        // After-All only brackets a Before-All that actually ran.
        if !gate.before.initialized() {
            return Vec::new();
        }

        let chain = self.hooks.resolve_chain(&gate.meta, scope, HookPhase::After);
        if chain.is_empty() {
            return Vec::new();
        }
        debug!(owner = %gate.owner(), ?scope, "running after-all chain");
        let ctx = self.context(gate, scope, HookPhase::After);
        match run_chain(&chain, &ctx, self.hook_timeout, &self.cancel).await {
            ChainResult::Completed { failures } => failures,
            ChainResult::Cancelled => Vec::new(),
        }
    }

    fn context(&self, gate: &Gate, scope: HookScope, phase: HookPhase) -> HookContext {
        let class_name = if gate.meta.name.is_empty() {
            None
        } else {
            Some(gate.meta.name.clone())
        };
        HookContext {
            test_id: None,
            class_name,
            scope,
            phase,
            cancellation: self.cancel.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HookError;
    use crate::hooks::HookAction;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn counting(name: &str, counter: Arc<AtomicUsize>) -> HookAction {
        HookAction::from_fn(name, move |_ctx| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    fn gates(hooks: HookRegistry, members: &[Arc<TestDescriptor>]) -> ScopeGates {
        ScopeGates::build(
            members.iter(),
            Arc::new(hooks),
            CancellationSignal::new(),
            Duration::from_secs(5),
        )
    }

    fn member(class: &str, method: &str) -> Arc<TestDescriptor> {
        Arc::new(
            TestDescriptor::builder(ClassMetadata::new(class, "suite"), method).build(),
        )
    }

    #[tokio::test]
    async fn test_before_all_once_after_all_on_last_leave() {
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));

        let mut hooks = HookRegistry::new();
        hooks.register(
            HookScope::Class,
            HookPhase::Before,
            "Suite",
            counting("before-all", before.clone()),
        );
        hooks.register(
            HookScope::Class,
            HookPhase::After,
            "Suite",
            counting("after-all", after.clone()),
        );

        let members = vec![member("Suite", "a"), member("Suite", "b")];
        let gates = gates(hooks, &members);
        let class = members[0].class.clone();

        gates.enter(&class).await.unwrap();
        gates.enter(&class).await.unwrap();
        assert_eq!(before.load(Ordering::SeqCst), 1);

        assert!(gates.leave(&class).await.is_empty());
        assert_eq!(after.load(Ordering::SeqCst), 0);

        assert!(gates.leave(&class).await.is_empty());
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_assembly_gate_spans_classes() {
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));

        let mut hooks = HookRegistry::new();
        hooks.register(
            HookScope::Assembly,
            HookPhase::Before,
            "suite",
            counting("assembly-before", before.clone()),
        );
        hooks.register(
            HookScope::Assembly,
            HookPhase::After,
            "suite",
            counting("assembly-after", after.clone()),
        );

        let members = vec![member("One", "a"), member("Two", "b")];
        let gates = gates(hooks, &members);
        let first = members[0].class.clone();
        let second = members[1].class.clone();

        gates.enter(&first).await.unwrap();
        gates.enter(&second).await.unwrap();
        assert_eq!(before.load(Ordering::SeqCst), 1);

        assert!(gates.leave(&first).await.is_empty());
        assert_eq!(after.load(Ordering::SeqCst), 0);

        assert!(gates.leave(&second).await.is_empty());
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_before_all_failure_replays_to_every_member() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_probe = attempts.clone();

        let mut hooks = HookRegistry::new();
        hooks.register(
            HookScope::Class,
            HookPhase::Before,
            "Suite",
            HookAction::from_fn("broken", move |_ctx| {
                let attempts = attempts_probe.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(HookError::new("no database"))
                })
            }),
        );

        let members = vec![member("Suite", "a"), member("Suite", "b")];
        let gates = gates(hooks, &members);
        let class = members[0].class.clone();

        let first = gates.enter(&class).await.unwrap_err();
        let second = gates.enter(&class).await.unwrap_err();

        assert_eq!(first.category, FailureCategory::Setup);
        assert_eq!(first, second);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inherited_before_all_bracketing() {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let push = |label: &'static str, log: Arc<Mutex<Vec<&'static str>>>| {
            HookAction::from_fn(label, move |_ctx| {
                let log = log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(label);
                    Ok(())
                })
            })
        };

        let mut hooks = HookRegistry::new();
        hooks.register(HookScope::Class, HookPhase::Before, "Base", push("base-before", log.clone()));
        hooks.register(HookScope::Class, HookPhase::Before, "Leaf", push("leaf-before", log.clone()));
        hooks.register(HookScope::Class, HookPhase::After, "Base", push("base-after", log.clone()));
        hooks.register(HookScope::Class, HookPhase::After, "Leaf", push("leaf-after", log.clone()));

        let class = ClassMetadata::new("Leaf", "suite").with_ancestry(vec!["Base".into()]);
        let members = vec![Arc::new(
            TestDescriptor::builder(class.clone(), "only").build(),
        )];
        let gates = gates(hooks, &members);

        gates.enter(&class).await.unwrap();
        gates.leave(&class).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["base-before", "leaf-before", "leaf-after", "base-after"]
        );
    }
}
