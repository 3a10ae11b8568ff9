//! Test session orchestration
//!
//! The public entry point: builds the dependency graph, runs session-level
//! Before/After hooks, drives the dispatcher, and tears fixtures down. Each
//! session runs once and consumes itself.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cancellation::CancellationSignal;
use crate::config::SessionConfig;
use crate::error::DiscoveryError;
use crate::fixture::{FixtureFactory, FixtureManager, FixtureScope};
use crate::graph::ExecutionGraph;
use crate::hooks::{
    run_chain, ChainResult, HookContext, HookPhase, HookRegistry, HookScope, ScopeGates,
};
use crate::models::{
    ClassMetadata, FailureCategory, Outcome, SessionSummary, TestDescriptor, TestFailure,
    TestReport,
};
use crate::utils::Timer;

use super::dispatch::Dispatcher;
use super::worker::ExecutionEnv;

/// One test run: descriptors in, a [`SessionSummary`] out.
pub struct TestSession {
    config: SessionConfig,
    hooks: HookRegistry,
    fixtures: Arc<FixtureManager>,
    cancel: CancellationSignal,
}

impl TestSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            hooks: HookRegistry::new(),
            fixtures: Arc::new(FixtureManager::new()),
            cancel: CancellationSignal::new(),
        }
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    pub fn register_fixture_factory(
        &self,
        type_name: impl Into<String>,
        scope: FixtureScope,
        factory: FixtureFactory,
    ) {
        self.fixtures.register_factory(type_name, scope, factory);
    }

    /// Clone of the session's cancellation signal, for the host to trigger.
    pub fn cancellation(&self) -> CancellationSignal {
        self.cancel.clone()
    }

    /// Run every descriptor to a terminal report.
    pub async fn run(
        self,
        descriptors: Vec<TestDescriptor>,
    ) -> Result<SessionSummary, DiscoveryError> {
        self.run_internal(descriptors, None).await
    }

    /// Like [`run`](Self::run), but forwards each report to `reports_tx` the
    /// moment it is terminal, for hosts that render progressively.
    pub async fn run_streaming(
        self,
        descriptors: Vec<TestDescriptor>,
        reports_tx: mpsc::UnboundedSender<TestReport>,
    ) -> Result<SessionSummary, DiscoveryError> {
        self.run_internal(descriptors, Some(reports_tx)).await
    }

    async fn run_internal(
        self,
        descriptors: Vec<TestDescriptor>,
        reports_tx: Option<mpsc::UnboundedSender<TestReport>>,
    ) -> Result<SessionSummary, DiscoveryError> {
        let started_at = Utc::now();
        let timer = Timer::start();

        let graph = Arc::new(ExecutionGraph::build(descriptors)?);
        self.validate_fixtures(&graph)?;
        info!(
            tests = graph.len(),
            parallelism = self.config.parallelism,
            "session starting"
        );

        let hooks = Arc::new(self.hooks);
        let hook_timeout = self.config.default_timeout();
        let session_class = ClassMetadata::new("", "");

        let before = hooks.resolve_chain(&session_class, HookScope::Session, HookPhase::Before);
        let setup_failure = match run_chain(
            &before,
            &session_hook_ctx(HookPhase::Before, &self.cancel),
            hook_timeout,
            &self.cancel,
        )
        .await
        {
            ChainResult::Completed { failures } => failures.into_iter().next(),
            ChainResult::Cancelled => Some(TestFailure::new(
                FailureCategory::Setup,
                "cancelled during session setup",
            )),
        };

        let reports = match setup_failure {
            Some(failure) => {
                // Nothing is scheduled when session setup fails, but every
                // descriptor still gets its terminal report.
                warn!(%failure, "session setup failed, failing every test");
                graph
                    .nodes()
                    .iter()
                    .map(|node| {
                        let report = TestReport::unscheduled(
                            node.descriptor.id.clone(),
                            node.descriptor.display_name.clone(),
                            Outcome::Failed(failure.clone()),
                        );
                        if let Some(tx) = &reports_tx {
                            let _ = tx.send(report.clone());
                        }
                        report
                    })
                    .collect()
            }
            None => {
                let gates = ScopeGates::build(
                    graph.nodes().iter().map(|node| &node.descriptor),
                    hooks.clone(),
                    self.cancel.clone(),
                    hook_timeout,
                );
                let env = Arc::new(ExecutionEnv {
                    hooks: hooks.clone(),
                    gates,
                    fixtures: self.fixtures.clone(),
                    cancel: self.cancel.clone(),
                    default_timeout: self.config.default_timeout(),
                });
                Dispatcher::new(graph.clone(), env, &self.config, reports_tx)
                    .run()
                    .await
            }
        };

        // Session teardown runs regardless of how the run ended.
        let after = hooks.resolve_chain(&session_class, HookScope::Session, HookPhase::After);
        if let ChainResult::Completed { failures } = run_chain(
            &after,
            &session_hook_ctx(HookPhase::After, &self.cancel),
            hook_timeout,
            &self.cancel,
        )
        .await
        {
            for failure in failures {
                warn!(%failure, "session teardown hook failed");
            }
        }

        for failure in self.fixtures.teardown().await {
            warn!(%failure, "fixture teardown failed");
        }

        let summary = SessionSummary::new(started_at, reports);
        info!(
            total = summary.total,
            passed = summary.passed,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            timed_out = summary.timed_out,
            duration_ms = timer.elapsed_ms(),
            "session finished"
        );
        Ok(summary)
    }

    fn validate_fixtures(&self, graph: &ExecutionGraph) -> Result<(), DiscoveryError> {
        for node in graph.nodes() {
            for type_name in &node.descriptor.fixtures {
                if !self.fixtures.has_factory(type_name) {
                    return Err(DiscoveryError::MissingFixtureFactory {
                        test: node.descriptor.id.as_str().to_string(),
                        type_name: type_name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for TestSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

fn session_hook_ctx(phase: HookPhase, cancel: &CancellationSignal) -> HookContext {
    HookContext {
        test_id: None,
        class_name: None,
        scope: HookScope::Session,
        phase,
        cancellation: cancel.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HookError;
    use crate::fixture::Fixture;
    use crate::hooks::HookAction;
    use crate::models::{BodyError, DependsOn, ParallelConstraint, TestId, TestRef};
    use std::any::Any;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn class(name: &str) -> ClassMetadata {
        ClassMetadata::new(name, "suite")
    }

    fn passing(name: &str) -> TestDescriptor {
        TestDescriptor::builder(class("Suite"), name)
            .body_fn(|_ctx| Box::pin(async { Ok(()) }))
            .build()
    }

    fn failing(name: &str) -> TestDescriptor {
        TestDescriptor::builder(class("Suite"), name)
            .body_fn(|_ctx| Box::pin(async { Err(BodyError::Assertion("boom".into())) }))
            .build()
    }

    fn outcome_of<'a>(summary: &'a SessionSummary, id: &str) -> &'a Outcome {
        &summary
            .report_for(&TestId::new(id))
            .unwrap_or_else(|| panic!("no report for {id}"))
            .outcome
    }

    /// Tracks how many bodies overlap in time.
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_every_descriptor_gets_one_report() {
        crate::utils::init_logger(crate::utils::LogLevel::Debug);
        let session = TestSession::default();
        let summary = session
            .run(vec![passing("a"), failing("b"), passing("c")])
            .await
            .unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
        assert!(outcome_of(&summary, "Suite::a").is_passed());
    }

    #[tokio::test]
    async fn test_hard_dependency_failure_cascades() {
        let leader = failing("leader");
        let hard = TestDescriptor::builder(class("Suite"), "hard")
            .depends_on(DependsOn::hard(TestRef::named("Suite::leader")))
            .build();
        let soft = TestDescriptor::builder(class("Suite"), "soft")
            .depends_on(DependsOn::soft(TestRef::named("Suite::leader")))
            .build();
        let transitive = TestDescriptor::builder(class("Suite"), "transitive")
            .depends_on(DependsOn::hard(TestRef::named("Suite::hard")))
            .build();

        let summary = TestSession::default()
            .run(vec![leader, hard, soft, transitive])
            .await
            .unwrap();

        assert!(matches!(outcome_of(&summary, "Suite::leader"), Outcome::Failed(_)));
        assert_eq!(
            outcome_of(&summary, "Suite::hard"),
            &Outcome::Skipped { reason: "dependency failed".into() }
        );
        assert_eq!(
            outcome_of(&summary, "Suite::transitive"),
            &Outcome::Skipped { reason: "dependency failed".into() }
        );
        assert!(outcome_of(&summary, "Suite::soft").is_passed());
    }

    #[tokio::test]
    async fn test_dependency_runs_before_dependent() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let record = |label: &'static str, order: Arc<Mutex<Vec<&'static str>>>| {
            move |_ctx| -> futures::future::BoxFuture<'static, Result<(), BodyError>> {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(label);
                    Ok(())
                })
            }
        };

        let first = TestDescriptor::builder(class("Suite"), "first")
            .body_fn(record("first", order.clone()))
            .build();
        let second = TestDescriptor::builder(class("Suite"), "second")
            .depends_on(DependsOn::hard(TestRef::named("Suite::first")))
            .body_fn(record("second", order.clone()))
            .build();

        // Dependent listed first; the graph must still order them.
        let summary = TestSession::default().run(vec![second, first]).await.unwrap();
        assert_eq!(summary.passed, 2);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_serial_lane_runs_one_at_a_time_in_declared_order() {
        let gauge = Arc::new(Gauge::default());
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let serial = |name: &'static str, declared: i32| {
            let gauge = gauge.clone();
            let order = order.clone();
            TestDescriptor::builder(class("Suite"), name)
                .parallel(ParallelConstraint::serial_keyed("db", declared))
                .body_fn(move |_ctx| {
                    let gauge = gauge.clone();
                    let order = order.clone();
                    Box::pin(async move {
                        gauge.enter();
                        order.lock().unwrap().push(name);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        gauge.exit();
                        Ok(())
                    })
                })
                .build()
        };

        // Discovery order disagrees with declared order on purpose.
        let summary = TestSession::default()
            .run(vec![serial("third", 3), serial("first", 1), serial("second", 2)])
            .await
            .unwrap();

        assert_eq!(summary.passed, 3);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_parallel_group_respects_cap() {
        let gauge = Arc::new(Gauge::default());
        let grouped = |name: &'static str| {
            let gauge = gauge.clone();
            TestDescriptor::builder(class("Suite"), name)
                .parallel(ParallelConstraint::group_limited(
                    "slow",
                    NonZeroUsize::new(2).unwrap(),
                ))
                .body_fn(move |_ctx| {
                    let gauge = gauge.clone();
                    Box::pin(async move {
                        gauge.enter();
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        gauge.exit();
                        Ok(())
                    })
                })
                .build()
        };

        let session = TestSession::new(SessionConfig::default().with_parallelism(8));
        let summary = session
            .run(vec![grouped("a"), grouped("b"), grouped("c"), grouped("d")])
            .await
            .unwrap();

        assert_eq!(summary.passed, 4);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancellation_drains_pending_and_running() {
        let entered = Arc::new(AtomicUsize::new(0));
        let stuck = |name: &'static str| {
            let entered = entered.clone();
            TestDescriptor::builder(class("Suite"), name)
                .body_fn(move |_ctx| {
                    let entered = entered.clone();
                    Box::pin(async move {
                        entered.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(())
                    })
                })
                .build()
        };

        let session = TestSession::new(SessionConfig::default().with_parallelism(2));
        let cancel = session.cancellation();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let summary = session
            .run(vec![stuck("a"), stuck("b"), stuck("c"), stuck("d")])
            .await
            .unwrap();

        assert_eq!(summary.cancelled, 4);
        // Only as many bodies as the pool admits ever started.
        assert_eq!(entered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_after_all_runs_when_member_is_skipped() {
        let after_all = Arc::new(AtomicUsize::new(0));

        let mut session = TestSession::default();
        let probe = after_all.clone();
        session.hooks_mut().register(
            HookScope::Class,
            HookPhase::After,
            "Suite",
            HookAction::from_fn("class-after-all", move |_ctx| {
                let after_all = probe.clone();
                Box::pin(async move {
                    after_all.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        // The dependent never executes, but it still leaves the class.
        let dependent = TestDescriptor::builder(class("Suite"), "dependent")
            .depends_on(DependsOn::hard(TestRef::named("Suite::leader")))
            .build();
        let summary = session
            .run(vec![failing("leader"), dependent])
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(after_all.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_after_all_runs_when_members_are_cancelled() {
        let after_all = Arc::new(AtomicUsize::new(0));

        let mut session = TestSession::new(SessionConfig::default().with_parallelism(1));
        let probe = after_all.clone();
        session.hooks_mut().register(
            HookScope::Class,
            HookPhase::After,
            "Suite",
            HookAction::from_fn("class-after-all", move |_ctx| {
                let after_all = probe.clone();
                Box::pin(async move {
                    after_all.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        let cancel = session.cancellation();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let stuck = TestDescriptor::builder(class("Suite"), "stuck")
            .body_fn(|_ctx| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                })
            })
            .build();
        let summary = session
            .run(vec![stuck, passing("pending")])
            .await
            .unwrap();

        assert_eq!(summary.cancelled, 2);
        assert_eq!(after_all.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_running_test_still_runs_after_hooks() {
        let after_ran = Arc::new(AtomicUsize::new(0));

        let mut session = TestSession::default();
        let probe = after_ran.clone();
        session.hooks_mut().register(
            HookScope::Test,
            HookPhase::After,
            "Suite",
            HookAction::from_fn("cleanup", move |_ctx| {
                let after = probe.clone();
                Box::pin(async move {
                    after.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        let cancel = session.cancellation();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let stuck = TestDescriptor::builder(class("Suite"), "stuck")
            .body_fn(|_ctx| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                })
            })
            .build();
        let summary = session.run(vec![stuck]).await.unwrap();

        assert_eq!(summary.cancelled, 1);
        assert_eq!(after_ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_rest() {
        let config = SessionConfig::default()
            .with_parallelism(1)
            .with_fail_fast(true);
        let summary = TestSession::new(config)
            .run(vec![failing("first"), passing("second"), passing("third")])
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cancelled, 2);
    }

    #[tokio::test]
    async fn test_hooks_bracket_body_across_inheritance() {
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

        let mut session = TestSession::default();
        let hooks = session.hooks_mut();
        hooks.register(HookScope::Test, HookPhase::Before, "Base", push("base-before", log.clone()));
        hooks.register(HookScope::Test, HookPhase::Before, "Mid", push("mid-before", log.clone()));
        hooks.register(HookScope::Test, HookPhase::Before, "Leaf", push("leaf-before", log.clone()));
        hooks.register(HookScope::Test, HookPhase::After, "Base", push("base-after", log.clone()));
        hooks.register(HookScope::Test, HookPhase::After, "Mid", push("mid-after", log.clone()));
        hooks.register(HookScope::Test, HookPhase::After, "Leaf", push("leaf-after", log.clone()));

        let body_log = log.clone();
        let descriptor = TestDescriptor::builder(
            ClassMetadata::new("Leaf", "suite").with_ancestry(vec!["Base".into(), "Mid".into()]),
            "run",
        )
        .body_fn(move |_ctx| {
            let log = body_log.clone();
            Box::pin(async move {
                log.lock().unwrap().push("body");
                Ok(())
            })
        })
        .build();

        let summary = session.run(vec![descriptor]).await.unwrap();
        assert_eq!(summary.passed, 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "base-before",
                "mid-before",
                "leaf-before",
                "body",
                "leaf-after",
                "mid-after",
                "base-after"
            ]
        );
    }

    #[tokio::test]
    async fn test_session_setup_failure_fails_every_test() {
        let body_ran = Arc::new(AtomicUsize::new(0));

        let mut session = TestSession::default();
        session.hooks_mut().register_session(
            HookPhase::Before,
            HookAction::from_fn("broken-session-setup", |_ctx| {
                Box::pin(async { Err(HookError::new("environment missing")) })
            }),
        );

        let body_probe = body_ran.clone();
        let descriptor = TestDescriptor::builder(class("Suite"), "never")
            .body_fn(move |_ctx| {
                let body = body_probe.clone();
                Box::pin(async move {
                    body.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .build();

        let summary = session.run(vec![descriptor, passing("also-never")]).await.unwrap();
        assert_eq!(summary.failed, 2);
        assert_eq!(body_ran.load(Ordering::SeqCst), 0);
        for report in &summary.reports {
            match &report.outcome {
                Outcome::Failed(failure) => {
                    assert_eq!(failure.category, FailureCategory::Setup)
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_unregistered_fixture_rejected_before_scheduling() {
        let descriptor = TestDescriptor::builder(class("Suite"), "needs-db")
            .fixture("Database")
            .build();
        let err = TestSession::default().run(vec![descriptor]).await.unwrap_err();
        assert_eq!(
            err,
            DiscoveryError::MissingFixtureFactory {
                test: "Suite::needs-db".into(),
                type_name: "Database".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_session_fixture_shared_and_disposed_once() {
        #[derive(Default)]
        struct Tally {
            created: AtomicUsize,
            disposed: AtomicUsize,
        }

        struct Db {
            tally: Arc<Tally>,
        }

        #[async_trait::async_trait]
        impl Fixture for Db {
            async fn dispose(&self) -> Result<(), crate::error::FixtureError> {
                self.tally.disposed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            fn as_any(&self) -> &(dyn Any + Send + Sync) {
                self
            }
        }

        let tally = Arc::new(Tally::default());
        let session = TestSession::default();
        let factory_tally = tally.clone();
        session.register_fixture_factory(
            "Db",
            FixtureScope::PerSession,
            Arc::new(move || {
                factory_tally.created.fetch_add(1, Ordering::SeqCst);
                Arc::new(Db {
                    tally: factory_tally.clone(),
                })
            }),
        );

        // Bodies overlap so both tests hold the fixture at the same time.
        let uses_db = |name: &'static str| {
            TestDescriptor::builder(class("Suite"), name)
                .fixture("Db")
                .body_fn(|ctx| {
                    Box::pin(async move {
                        if ctx.fixture("Db").is_none() {
                            return Err(BodyError::NullValue("fixture not attached".into()));
                        }
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    })
                })
                .build()
        };

        let summary = session.run(vec![uses_db("a"), uses_db("b")]).await.unwrap();
        assert_eq!(summary.passed, 2);
        assert_eq!(tally.created.load(Ordering::SeqCst), 1);
        assert_eq!(tally.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_streaming_reports_arrive_per_test() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let summary = TestSession::default()
            .run_streaming(vec![passing("a"), failing("b")], tx)
            .await
            .unwrap();

        let mut streamed = Vec::new();
        while let Ok(report) = rx.try_recv() {
            streamed.push(report);
        }
        assert_eq!(streamed.len(), summary.total);
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let err = TestSession::default()
            .run(vec![passing("same"), passing("same")])
            .await
            .unwrap_err();
        assert_eq!(err, DiscoveryError::DuplicateTestId("Suite::same".into()));
    }
}
