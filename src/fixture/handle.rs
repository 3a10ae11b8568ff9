//! Reference-counted fixture handles

use std::fmt;
use std::sync::Arc;

use super::{Fixture, FixtureKey};

/// A consumer's hold on a fixture instance.
///
/// Shared handles count against the registry entry for their key; the
/// handle must be given back through [`super::FixtureManager::release`],
/// which disposes the instance once the last holder is gone. Exclusive
/// (per-invocation) handles own their instance outright.
pub struct FixtureHandle {
    type_name: String,
    key: Option<FixtureKey>,
    instance: Arc<dyn Fixture>,
}

impl FixtureHandle {
    pub(crate) fn shared(key: FixtureKey, instance: Arc<dyn Fixture>) -> Self {
        Self {
            type_name: key.type_name.clone(),
            key: Some(key),
            instance,
        }
    }

    pub(crate) fn exclusive(type_name: impl Into<String>, instance: Arc<dyn Fixture>) -> Self {
        Self {
            type_name: type_name.into(),
            key: None,
            instance,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn instance(&self) -> &Arc<dyn Fixture> {
        &self.instance
    }

    pub(crate) fn key(&self) -> Option<&FixtureKey> {
        self.key.as_ref()
    }
}

impl fmt::Debug for FixtureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureHandle")
            .field("type_name", &self.type_name)
            .field("key", &self.key)
            .finish()
    }
}
