//! Test descriptors
//!
//! Immutable records of one runnable test instance and its declared
//! constraints. Descriptors are produced by an external discovery
//! collaborator; the core never inspects source-level annotations.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancellationSignal;
use crate::fixture::Fixture;

use super::constraint::ParallelConstraint;
use super::outcome::{FailureCategory, TestFailure};

/// Unique identity of one runnable test instance:
/// qualified class path + method + argument signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestId(String);

impl TestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the class a test belongs to, with its precomputed ancestry.
///
/// `ancestry` lists base classes oldest-ancestor-first, excluding the class
/// itself; hook resolution walks it rather than doing any runtime dispatch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMetadata {
    pub name: String,
    pub assembly: String,
    pub ancestry: Vec<String>,
}

impl ClassMetadata {
    pub fn new(name: impl Into<String>, assembly: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            assembly: assembly.into(),
            ancestry: Vec::new(),
        }
    }

    /// Base classes, oldest first.
    pub fn with_ancestry(mut self, ancestry: Vec<String>) -> Self {
        self.ancestry = ancestry;
        self
    }

    /// Full type chain, oldest ancestor first, ending with the class itself.
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        self.ancestry
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.name.as_str()))
    }
}

/// Reference to another test, as written in a dependency declaration.
///
/// `qualified_name` is either `Class::method` (matches one test per argument
/// set) or a bare class name (matches every test in the class). When
/// `arg_signature` is given, only the instance with that argument display
/// matches.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestRef {
    pub qualified_name: String,
    pub arg_signature: Option<String>,
}

impl TestRef {
    pub fn named(qualified_name: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            arg_signature: None,
        }
    }

    pub fn with_args(qualified_name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            arg_signature: Some(args.into()),
        }
    }
}

impl fmt::Display for TestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.arg_signature {
            Some(args) => write!(f, "{}({})", self.qualified_name, args),
            None => f.write_str(&self.qualified_name),
        }
    }
}

/// One declared dependency edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependsOn {
    pub target: TestRef,
    /// Soft edge: the dependent runs regardless of the predecessor outcome.
    pub proceed_on_failure: bool,
}

impl DependsOn {
    pub fn hard(target: TestRef) -> Self {
        Self {
            target,
            proceed_on_failure: false,
        }
    }

    pub fn soft(target: TestRef) -> Self {
        Self {
            target,
            proceed_on_failure: true,
        }
    }
}

/// Predicate deciding whether a given failure is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&TestFailure) -> bool + Send + Sync>;

/// Retry policy for a test body. Before-hooks are never re-run on retry.
#[derive(Clone, Default)]
pub struct RetryPolicy {
    pub count: u32,
    pub predicate: Option<RetryPredicate>,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn times(count: u32) -> Self {
        Self {
            count,
            predicate: None,
        }
    }

    pub fn when(count: u32, predicate: RetryPredicate) -> Self {
        Self {
            count,
            predicate: Some(predicate),
        }
    }

    /// Whether this failure qualifies for another attempt.
    pub fn accepts(&self, failure: &TestFailure) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(failure),
            None => true,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("count", &self.count)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Error raised by a test body. The variant drives failure categorization
/// and nothing else.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BodyError {
    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("null value: {0}")]
    NullValue(String),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("{0}")]
    Other(String),
}

impl BodyError {
    pub fn category(&self) -> FailureCategory {
        match self {
            BodyError::Assertion(_) => FailureCategory::Assertion,
            BodyError::NullValue(_) => FailureCategory::NullReference,
            BodyError::Infrastructure(_) => FailureCategory::Infrastructure,
            BodyError::Other(_) => FailureCategory::Unknown,
        }
    }
}

/// Context handed to a test body for the duration of one attempt.
#[derive(Clone)]
pub struct TestContext {
    pub test_id: TestId,
    pub display_name: String,
    /// 1-based attempt number; greater than 1 during retries.
    pub attempt: u32,
    pub cancellation: CancellationSignal,
    fixtures: Arc<HashMap<String, Arc<dyn Fixture>>>,
}

impl TestContext {
    pub(crate) fn new(
        test_id: TestId,
        display_name: String,
        attempt: u32,
        cancellation: CancellationSignal,
        fixtures: Arc<HashMap<String, Arc<dyn Fixture>>>,
    ) -> Self {
        Self {
            test_id,
            display_name,
            attempt,
            cancellation,
            fixtures,
        }
    }

    /// Fixture instance acquired for this test, by registered type name.
    /// Downcast via [`Fixture::as_any`].
    pub fn fixture(&self, type_name: &str) -> Option<Arc<dyn Fixture>> {
        self.fixtures.get(type_name).cloned()
    }
}

/// The async test body. Spawned on the runtime so panics are contained.
pub type TestBody =
    Arc<dyn Fn(TestContext) -> BoxFuture<'static, Result<(), BodyError>> + Send + Sync>;

/// Immutable record of one runnable test instance.
#[derive(Clone)]
pub struct TestDescriptor {
    pub id: TestId,
    pub class: ClassMetadata,
    pub method_name: String,
    pub display_name: String,
    pub argument_display: Option<String>,
    pub depends_on: Vec<DependsOn>,
    pub parallel: ParallelConstraint,
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    /// Type names of fixtures this test consumes; factories are registered
    /// separately on the session.
    pub fixtures: Vec<String>,
    pub body: TestBody,
}

impl TestDescriptor {
    pub fn builder(class: ClassMetadata, method_name: impl Into<String>) -> TestDescriptorBuilder {
        TestDescriptorBuilder::new(class, method_name)
    }

    /// `Class::method`, without the argument signature.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.class.name, self.method_name)
    }
}

impl fmt::Debug for TestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDescriptor")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("depends_on", &self.depends_on)
            .field("parallel", &self.parallel)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("fixtures", &self.fixtures)
            .finish()
    }
}

/// Builder for [`TestDescriptor`]. The id is derived from class, method and
/// argument signature; a body defaults to an empty passing one so data-only
/// construction stays cheap in tests.
pub struct TestDescriptorBuilder {
    class: ClassMetadata,
    method_name: String,
    display_name: Option<String>,
    argument_display: Option<String>,
    depends_on: Vec<DependsOn>,
    parallel: ParallelConstraint,
    timeout: Option<Duration>,
    retry: RetryPolicy,
    fixtures: Vec<String>,
    body: Option<TestBody>,
}

impl TestDescriptorBuilder {
    fn new(class: ClassMetadata, method_name: impl Into<String>) -> Self {
        Self {
            class,
            method_name: method_name.into(),
            display_name: None,
            argument_display: None,
            depends_on: Vec::new(),
            parallel: ParallelConstraint::default(),
            timeout: None,
            retry: RetryPolicy::none(),
            fixtures: Vec::new(),
            body: None,
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn args(mut self, display: impl Into<String>) -> Self {
        self.argument_display = Some(display.into());
        self
    }

    pub fn depends_on(mut self, dependency: DependsOn) -> Self {
        self.depends_on.push(dependency);
        self
    }

    pub fn parallel(mut self, constraint: ParallelConstraint) -> Self {
        self.parallel = constraint;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn fixture(mut self, type_name: impl Into<String>) -> Self {
        self.fixtures.push(type_name.into());
        self
    }

    pub fn body(mut self, body: TestBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Convenience wrapper for closures returning a boxed future.
    pub fn body_fn<F>(self, f: F) -> Self
    where
        F: Fn(TestContext) -> BoxFuture<'static, Result<(), BodyError>> + Send + Sync + 'static,
    {
        self.body(Arc::new(f))
    }

    pub fn build(self) -> TestDescriptor {
        let qualified = format!("{}::{}", self.class.name, self.method_name);
        let id = match &self.argument_display {
            Some(args) => TestId::new(format!("{qualified}({args})")),
            None => TestId::new(qualified.clone()),
        };
        let display_name = self.display_name.unwrap_or_else(|| id.as_str().to_string());
        let body = self
            .body
            .unwrap_or_else(|| Arc::new(|_ctx| Box::pin(async { Ok(()) })));

        TestDescriptor {
            id,
            class: self.class,
            method_name: self.method_name,
            display_name,
            argument_display: self.argument_display,
            depends_on: self.depends_on,
            parallel: self.parallel,
            timeout: self.timeout,
            retry: self.retry,
            fixtures: self.fixtures,
            body,
        }
    }
}
