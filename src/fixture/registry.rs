//! Fixture registry and lifecycle manager
//!
//! One live instance per distinct [`FixtureKey`]: creation is synchronized
//! per key so concurrent first-acquirers never race to construct two
//! instances, and a pending disposal blocks re-creation under the same key
//! until it finishes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{watch, Mutex, OnceCell};
use tracing::{debug, warn};

use crate::models::TestDescriptor;

use super::{
    Fixture, FixtureFactory, FixtureFailure, FixtureHandle, FixtureKey, FixtureScope,
};

/// Broadcast result of a key's once-only initialization.
type InitCell = OnceCell<Result<Arc<dyn Fixture>, FixtureFailure>>;

struct LiveSlot {
    cell: Arc<InitCell>,
    refs: usize,
}

enum Slot {
    Live(LiveSlot),
    /// Disposal in flight; the receiver resolves (errs) when it finishes.
    Disposing(watch::Receiver<()>),
}

struct FactoryEntry {
    scope: FixtureScope,
    factory: FixtureFactory,
}

enum AcquireStep {
    Init(Arc<InitCell>),
    Wait(watch::Receiver<()>),
}

/// Owns every shared fixture instance for one session.
///
/// Created at session start and torn down at session end; passed explicitly
/// into the scheduler rather than living as ambient global state.
pub struct FixtureManager {
    factories: RwLock<HashMap<String, FactoryEntry>>,
    slots: Mutex<HashMap<FixtureKey, Slot>>,
}

impl FixtureManager {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Register the factory for a fixture type. Supplied by the composition
    /// layer before scheduling begins; later registrations replace earlier
    /// ones for the same type name.
    pub fn register_factory(
        &self,
        type_name: impl Into<String>,
        scope: FixtureScope,
        factory: FixtureFactory,
    ) {
        let type_name = type_name.into();
        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        factories.insert(type_name, FactoryEntry { scope, factory });
    }

    pub fn has_factory(&self, type_name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(type_name)
    }

    /// Acquire every fixture a descriptor declares. On failure, handles
    /// acquired so far are released again before the error is returned.
    pub async fn acquire_for(
        &self,
        descriptor: &TestDescriptor,
    ) -> Result<Vec<FixtureHandle>, FixtureFailure> {
        let mut handles = Vec::with_capacity(descriptor.fixtures.len());
        for type_name in &descriptor.fixtures {
            match self.acquire_by_type(type_name, descriptor).await {
                Ok(handle) => handles.push(handle),
                Err(failure) => {
                    for handle in handles {
                        if let Err(release_failure) = self.release(handle).await {
                            warn!(%release_failure, "release during failed acquire");
                        }
                    }
                    return Err(failure);
                }
            }
        }
        Ok(handles)
    }

    async fn acquire_by_type(
        &self,
        type_name: &str,
        descriptor: &TestDescriptor,
    ) -> Result<FixtureHandle, FixtureFailure> {
        let (scope, factory) = {
            let factories = self
                .factories
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let entry = factories.get(type_name).ok_or_else(|| {
                FixtureFailure::setup(type_name, "no factory registered")
            })?;
            (entry.scope.clone(), entry.factory.clone())
        };

        match FixtureKey::for_scope(type_name, &scope, &descriptor.class) {
            None => {
                // Per-invocation: fresh instance, never shared.
                let instance = factory();
                instance
                    .initialize()
                    .await
                    .map_err(|e| FixtureFailure::setup(type_name, e.0))?;
                Ok(FixtureHandle::exclusive(type_name, instance))
            }
            Some(key) => self.acquire(key, factory).await,
        }
    }

    /// Acquire a hold on the shared instance for `key`, creating it through
    /// `factory` if this is the first acquire of the lifetime window.
    ///
    /// Exactly one caller runs the factory and `initialize`; everyone else
    /// awaits the broadcast result. A cached initialization failure is
    /// replayed, not re-attempted, for the rest of the window.
    pub async fn acquire(
        &self,
        key: FixtureKey,
        factory: FixtureFactory,
    ) -> Result<FixtureHandle, FixtureFailure> {
        loop {
            let step = {
                let mut slots = self.slots.lock().await;
                match slots.get_mut(&key) {
                    None => {
                        let cell: Arc<InitCell> = Arc::new(OnceCell::new());
                        slots.insert(
                            key.clone(),
                            Slot::Live(LiveSlot {
                                cell: cell.clone(),
                                refs: 1,
                            }),
                        );
                        AcquireStep::Init(cell)
                    }
                    Some(Slot::Live(slot)) => {
                        slot.refs += 1;
                        AcquireStep::Init(slot.cell.clone())
                    }
                    Some(Slot::Disposing(rx)) => AcquireStep::Wait(rx.clone()),
                }
            };

            match step {
                AcquireStep::Init(cell) => {
                    let result = cell
                        .get_or_init(|| async {
                            debug!(fixture = %key, "initializing fixture");
                            let instance = factory();
                            match instance.initialize().await {
                                Ok(()) => Ok(instance),
                                Err(e) => {
                                    warn!(fixture = %key, error = %e, "fixture initialization failed");
                                    Err(FixtureFailure::setup(&key.type_name, e.0))
                                }
                            }
                        })
                        .await;

                    return match result {
                        Ok(instance) => {
                            Ok(FixtureHandle::shared(key.clone(), instance.clone()))
                        }
                        Err(failure) => {
                            // No handle is held; the slot stays so the
                            // failure replays within the window.
                            self.drop_ref(&key).await;
                            Err(failure.clone())
                        }
                    };
                }
                AcquireStep::Wait(mut rx) => {
                    // Resolves with Err once the disposer drops the sender.
                    let _ = rx.changed().await;
                }
            }
        }
    }

    async fn drop_ref(&self, key: &FixtureKey) {
        let mut slots = self.slots.lock().await;
        if let Some(Slot::Live(slot)) = slots.get_mut(key) {
            slot.refs = slot.refs.saturating_sub(1);
        }
    }

    /// Give back a hold. When the count reaches zero the instance is
    /// disposed and the key removed; re-acquirers arriving during disposal
    /// wait for it to finish, then create a fresh instance.
    pub async fn release(&self, handle: FixtureHandle) -> Result<(), FixtureFailure> {
        let Some(key) = handle.key().cloned() else {
            return handle
                .instance()
                .dispose()
                .await
                .map_err(|e| FixtureFailure::teardown(handle.type_name(), e.0));
        };

        let to_dispose = {
            let mut slots = self.slots.lock().await;
            match slots.get_mut(&key) {
                Some(Slot::Live(slot)) => {
                    slot.refs = slot.refs.saturating_sub(1);
                    if slot.refs == 0 {
                        match slot.cell.get().and_then(|r| r.as_ref().ok().cloned()) {
                            Some(instance) => {
                                let (tx, rx) = watch::channel(());
                                slots.insert(key.clone(), Slot::Disposing(rx));
                                Some((instance, tx))
                            }
                            // A failed cell has nothing to dispose; it stays
                            // so the failure keeps replaying.
                            None => None,
                        }
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some((instance, tx)) = to_dispose {
            debug!(fixture = %key, "disposing fixture");
            let result = instance.dispose().await;
            {
                let mut slots = self.slots.lock().await;
                if matches!(slots.get(&key), Some(Slot::Disposing(_))) {
                    slots.remove(&key);
                }
            }
            drop(tx);
            if let Err(e) = result {
                warn!(fixture = %key, error = %e, "fixture disposal failed");
                return Err(FixtureFailure::teardown(&key.type_name, e.0));
            }
        }

        Ok(())
    }

    /// Session end: dispose every still-live instance (PerSession and Keyed
    /// windows end here), waiting out any in-flight disposals.
    pub async fn teardown(&self) -> Vec<FixtureFailure> {
        let mut failures = Vec::new();
        loop {
            let next = {
                let mut slots = self.slots.lock().await;
                let Some(key) = slots.keys().next().cloned() else {
                    break;
                };
                match slots.remove(&key) {
                    Some(Slot::Live(slot)) => {
                        if slot.refs > 0 {
                            warn!(fixture = %key, refs = slot.refs, "fixture still referenced at teardown");
                        }
                        let instance = slot.cell.get().and_then(|r| r.as_ref().ok().cloned());
                        (Some((key, instance)), None)
                    }
                    Some(Slot::Disposing(rx)) => (None, Some(rx)),
                    None => (None, None),
                }
            };

            match next {
                (Some((key, Some(instance))), _) => {
                    debug!(fixture = %key, "disposing fixture at session teardown");
                    if let Err(e) = instance.dispose().await {
                        failures.push(FixtureFailure::teardown(&key.type_name, e.0));
                    }
                }
                (_, Some(mut rx)) => {
                    let _ = rx.changed().await;
                }
                _ => {}
            }
        }
        failures
    }
}

impl Default for FixtureManager {
    fn default() -> Self {
        Self::new()
    }
}
