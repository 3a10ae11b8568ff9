//! Hook registration and chain resolution
//!
//! Chains are derived by walking a class's precomputed ancestry: Before
//! hooks run base-class-first, After hooks run in exact reverse, so setup
//! and teardown bracket symmetrically across multi-level inheritance.

use std::collections::HashMap;

use crate::models::ClassMetadata;

use super::{HookAction, HookPhase, HookScope};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct HookSlot {
    scope: HookScope,
    phase: HookPhase,
    owner: String,
}

/// All registered hooks for one session, queried per descriptor.
#[derive(Default)]
pub struct HookRegistry {
    owned: HashMap<HookSlot, Vec<HookAction>>,
    every: HashMap<(HookScope, HookPhase), Vec<HookAction>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook owned by a type (Test/Class scope: class name) or an
    /// assembly (Assembly scope: assembly name). Session-scope hooks take
    /// an empty owner.
    pub fn register(
        &mut self,
        scope: HookScope,
        phase: HookPhase,
        owner: impl Into<String>,
        action: HookAction,
    ) {
        self.owned
            .entry(HookSlot {
                scope,
                phase,
                owner: owner.into(),
            })
            .or_default()
            .push(action);
    }

    pub fn register_session(&mut self, phase: HookPhase, action: HookAction) {
        self.register(HookScope::Session, phase, "", action);
    }

    /// Register a global hook that wraps every scope instance at `scope`,
    /// independent of inheritance. Merged by declared order.
    pub fn register_every(&mut self, scope: HookScope, phase: HookPhase, action: HookAction) {
        self.every.entry((scope, phase)).or_default().push(action);
    }

    fn owned_for(&self, scope: HookScope, phase: HookPhase, owner: &str) -> &[HookAction] {
        self.owned
            .get(&HookSlot {
                scope,
                phase,
                owner: owner.to_string(),
            })
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn every_for(&self, scope: HookScope, phase: HookPhase) -> Vec<HookAction> {
        let mut actions = self
            .every
            .get(&(scope, phase))
            .cloned()
            .unwrap_or_default();
        actions.sort_by_key(HookAction::order);
        actions
    }

    /// The ordered chain for one descriptor at the given scope and phase.
    ///
    /// Before: globals, then ancestry oldest-first. After: ancestry
    /// most-derived-first, then globals. Globals are outermost both ways.
    pub fn resolve_chain(
        &self,
        class: &ClassMetadata,
        scope: HookScope,
        phase: HookPhase,
    ) -> Vec<HookAction> {
        let owners: Vec<&str> = match scope {
            HookScope::Test | HookScope::Class => {
                let chain: Vec<&str> = class.chain().collect();
                match phase {
                    HookPhase::Before => chain,
                    HookPhase::After => chain.into_iter().rev().collect(),
                }
            }
            HookScope::Assembly => vec![class.assembly.as_str()],
            HookScope::Session => vec![""],
        };

        let owned = owners
            .into_iter()
            .flat_map(|owner| self.owned_for(scope, phase, owner).iter().cloned());

        match phase {
            HookPhase::Before => self
                .every_for(scope, phase)
                .into_iter()
                .chain(owned)
                .collect(),
            HookPhase::After => owned.chain(self.every_for(scope, phase)).collect(),
        }
    }
}
