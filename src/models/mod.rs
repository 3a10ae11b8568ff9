//! Data model for the execution core
//!
//! Descriptors and constraints come in from the discovery collaborator;
//! outcomes and reports go out to the host adapter. Everything in here is
//! plain data plus the async body callbacks.

mod constraint;
mod descriptor;
mod outcome;

pub use constraint::{ParallelConstraint, GLOBAL_SERIAL_KEY};
pub use descriptor::{
    BodyError, ClassMetadata, DependsOn, RetryPolicy, RetryPredicate, TestBody, TestContext,
    TestDescriptor, TestDescriptorBuilder, TestId, TestRef,
};
pub use outcome::{FailureCategory, Outcome, SessionSummary, TestFailure, TestReport};
