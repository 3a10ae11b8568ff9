//! Parallelism constraints
//!
//! Declarative limits on how a test may share the worker pool, populated by
//! the discovery collaborator.

use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;

/// Lane key used for tests in the unkeyed (global) serial group.
pub const GLOBAL_SERIAL_KEY: &str = "";

/// How a test may run relative to other tests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParallelConstraint {
    /// No restriction beyond the global worker-pool limit.
    #[default]
    Unconstrained,

    /// Never runs concurrently with other tests sharing the same key.
    /// Members of a key execute in ascending `order`, ties broken by
    /// discovery order. `key: None` is the global serial group.
    NotInParallel { key: Option<String>, order: i32 },

    /// Member of a named group whose concurrency may be capped below the
    /// global limit. The first descriptor declaring a limit for a name wins.
    ParallelGroup {
        name: String,
        limit: Option<NonZeroUsize>,
    },
}

impl ParallelConstraint {
    /// Unkeyed serial constraint with default order.
    pub fn serial() -> Self {
        Self::NotInParallel { key: None, order: 0 }
    }

    pub fn serial_keyed(key: impl Into<String>, order: i32) -> Self {
        Self::NotInParallel {
            key: Some(key.into()),
            order,
        }
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::ParallelGroup {
            name: name.into(),
            limit: None,
        }
    }

    pub fn group_limited(name: impl Into<String>, limit: NonZeroUsize) -> Self {
        Self::ParallelGroup {
            name: name.into(),
            limit: Some(limit),
        }
    }

    /// Serial-lane key for `NotInParallel` members, `None` otherwise.
    pub fn lane_key(&self) -> Option<&str> {
        match self {
            Self::NotInParallel { key, .. } => {
                Some(key.as_deref().unwrap_or(GLOBAL_SERIAL_KEY))
            }
            _ => None,
        }
    }

    /// Declared order within a serial lane.
    pub fn lane_order(&self) -> i32 {
        match self {
            Self::NotInParallel { order, .. } => *order,
            _ => 0,
        }
    }
}
