//! Lock state lattice

use std::collections::BTreeMap;

use crate::contract::LockMode;
use crate::diagnostics::HeldLock;
use crate::resolve::{LockId, LockTable};

/// Mode of every lock at one program point. Locks without an entry are
/// not held, so each lock has exactly one mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockState {
    held: BTreeMap<LockId, LockMode>,
}

impl LockState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, lock: LockId) -> LockMode {
        self.held.get(&lock).copied().unwrap_or(LockMode::NotHeld)
    }

    pub fn set(&mut self, lock: LockId, mode: LockMode) {
        if mode == LockMode::NotHeld {
            self.held.remove(&lock);
        } else {
            self.held.insert(lock, mode);
        }
    }

    /// Join at a control-flow merge: per lock, the weaker of the two modes.
    /// A lock counts as held only if every incoming path holds it.
    pub fn join(&self, other: &LockState) -> LockState {
        let held = self
            .held
            .iter()
            .filter_map(|(lock, &mode)| other.held.get(lock).map(|&theirs| (*lock, mode.min(theirs))))
            .collect();
        LockState { held }
    }

    pub fn held(&self) -> impl Iterator<Item = (LockId, LockMode)> + '_ {
        self.held.iter().map(|(lock, mode)| (*lock, *mode))
    }

    /// Held locks by path, for diagnostics
    pub fn snapshot(&self, locks: &LockTable) -> Vec<HeldLock> {
        let mut held: Vec<HeldLock> = self
            .held()
            .map(|(lock, mode)| HeldLock {
                lock: locks.path(lock).to_string(),
                mode,
            })
            .collect();
        held.sort();
        held
    }
}
