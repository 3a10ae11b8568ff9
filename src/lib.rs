//! testflow - Concurrent Test Execution Engine
//!
//! The scheduling core of an async test framework: dependency-ordered
//! concurrent execution with shared fixture lifecycles and
//! inheritance-aware lifecycle hooks.
//!
//! ## Features
//!
//! - Dependency graph with hard/soft edges, cycle detection and skip cascade
//! - Bounded worker pool with serial lanes and capped parallel groups
//! - Shared fixtures initialized once per scope, disposed after the last consumer
//! - Before/After hook chains across class inheritance at test, class, assembly and session scope
//! - Retry policies, per-test timeouts, panic containment and cooperative cancellation
//!
//! ## Usage
//!
//! ```no_run
//! use testflow::models::ClassMetadata;
//! use testflow::{SessionConfig, TestDescriptor, TestSession};
//!
//! # async fn demo() -> Result<(), testflow::DiscoveryError> {
//! testflow::init_logger(testflow::LogLevel::Info);
//! let session = TestSession::new(SessionConfig::default().with_parallelism(8));
//!
//! let login = TestDescriptor::builder(ClassMetadata::new("Login", "app.tests"), "works")
//!     .body_fn(|_ctx| Box::pin(async { Ok(()) }))
//!     .build();
//!
//! let summary = session.run(vec![login]).await?;
//! assert!(summary.is_all_passed());
//! # Ok(())
//! # }
//! ```

pub mod cancellation;
pub mod config;
pub mod error;
pub mod fixture;
pub mod graph;
pub mod hooks;
pub mod models;
pub mod scheduler;
pub mod utils;

pub use cancellation::CancellationSignal;
pub use config::SessionConfig;
pub use error::{DiscoveryError, FixtureError, HookError};
pub use fixture::{Fixture, FixtureFactory, FixtureManager, FixtureScope};
pub use graph::ExecutionGraph;
pub use hooks::{HookAction, HookPhase, HookRegistry, HookScope};
pub use models::{
    BodyError, FailureCategory, Outcome, ParallelConstraint, SessionSummary, TestContext,
    TestDescriptor, TestFailure, TestId, TestReport,
};
pub use scheduler::TestSession;
pub use utils::{init_logger, LogLevel};
