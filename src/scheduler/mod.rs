//! Concurrent test scheduler
//!
//! Turns a validated dependency graph into bounded concurrent execution:
//! a dispatch coordinator admits ready units against the worker pool,
//! serial lanes and group caps; workers run the per-unit pipeline; the
//! session wraps the whole run with session-level hooks and teardown.

mod dispatch;
mod lanes;
mod session;
mod worker;

pub use session::TestSession;
