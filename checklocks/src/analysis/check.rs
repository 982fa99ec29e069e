//! Field-access and call-site rules
//!
//! Each rule inspects the lock state *before* the event, returns its
//! findings, and, for events with an effect, advances the state.

use std::collections::{BTreeMap, BTreeSet};

use crate::contract::LockMode;
use crate::diagnostics::RuleKind;
use crate::mir::AccessKind;
use crate::resolve::{CallEffect, FieldRule, LockId, LockOp, LockTable};

use super::LockState;

/// A rule violation, located by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub rule: RuleKind,
    pub message: String,
}

impl Finding {
    fn new(rule: RuleKind, message: String) -> Self {
        Self { rule, message }
    }
}

/// A field access being checked
#[derive(Debug, Clone, Copy)]
pub struct FieldAccess<'a> {
    pub place: &'a str,
    pub rule: FieldRule,
    pub lock: Option<LockId>,
    pub kind: AccessKind,
    pub atomic: bool,
}

fn requirement(mode: LockMode) -> &'static str {
    match mode {
        LockMode::HeldShared => "held (shared or exclusive)",
        _ => "held exclusively",
    }
}

// ============================================================================
// Field access
// ============================================================================

pub fn check_access(state: &LockState, locks: &LockTable, access: FieldAccess<'_>, shared_reads: bool) -> Vec<Finding> {
    let FieldAccess {
        place,
        rule,
        lock,
        kind,
        atomic,
    } = access;
    let mut findings = Vec::new();

    // Reads may be satisfied by a shared hold when configured so
    let required = if kind == AccessKind::Read && shared_reads {
        LockMode::HeldShared
    } else {
        LockMode::HeldExclusive
    };
    let held = |lock: LockId| state.get(lock) >= required;

    match (rule, lock) {
        (FieldRule::Guarded, Some(lock)) => {
            if !held(lock) {
                findings.push(Finding::new(
                    RuleKind::AccessViolation,
                    format!(
                        "invalid {kind} of `{place}`: `{}` must be {}",
                        locks.path(lock),
                        requirement(required)
                    ),
                ));
            }
        }

        (FieldRule::AtomicOnly, _) => {
            if !atomic {
                findings.push(Finding::new(
                    RuleKind::AtomicAccessViolation,
                    format!("non-atomic {kind} of `{place}`: field must be accessed atomically"),
                ));
            }
        }

        (FieldRule::Mixed, Some(lock)) => match kind {
            AccessKind::Read => {
                if !atomic && !held(lock) {
                    findings.push(Finding::new(
                        RuleKind::MixedModeViolation,
                        format!(
                            "invalid read of `{place}`: must be atomic or `{}` must be {}",
                            locks.path(lock),
                            requirement(required)
                        ),
                    ));
                }
            }
            AccessKind::Write => {
                if state.get(lock) != LockMode::HeldExclusive {
                    findings.push(Finding::new(
                        RuleKind::MixedModeViolation,
                        format!(
                            "invalid write of `{place}`: `{}` must be held exclusively",
                            locks.path(lock)
                        ),
                    ));
                }
                if !atomic {
                    findings.push(Finding::new(
                        RuleKind::AtomicAccessViolation,
                        format!("non-atomic write of `{place}`: writes must be atomic"),
                    ));
                }
            }
        },

        // Guarded/Mixed always carry a lock after resolution
        (FieldRule::Guarded | FieldRule::Mixed, None) => {}
    }

    findings
}

// ============================================================================
// Direct lock operations
// ============================================================================

pub fn apply_lock_op(state: &mut LockState, locks: &LockTable, lock: LockId, op: LockOp) -> Vec<Finding> {
    let current = state.get(lock);
    let path = locks.path(lock);

    match op {
        LockOp::Acquire(mode) => {
            if current != LockMode::NotHeld {
                // Keep the mode it is already held in
                return vec![Finding::new(
                    RuleKind::AcquireViolation,
                    format!("`{path}` is already held ({current})"),
                )];
            }
            state.set(lock, mode);
            Vec::new()
        }
        LockOp::Release(mode) => {
            state.set(lock, LockMode::NotHeld);
            if current == LockMode::NotHeld {
                vec![Finding::new(
                    RuleKind::ReleaseViolation,
                    format!("`{path}` released but not held"),
                )]
            } else if current != mode {
                vec![Finding::new(
                    RuleKind::ReleaseViolation,
                    format!("`{path}` released as {mode} but held {current}"),
                )]
            } else {
                Vec::new()
            }
        }
    }
}

/// Assume the lock held exclusively, whatever the state says
pub fn apply_force(state: &mut LockState, lock: LockId) {
    state.set(lock, LockMode::HeldExclusive);
}

// ============================================================================
// Calls
// ============================================================================

/// Check every precondition against the state before the call, then apply
/// the callee's effects
pub fn apply_call(state: &mut LockState, locks: &LockTable, callee: &str, effects: &[CallEffect]) -> Vec<Finding> {
    let before = state.clone();
    let mut findings = Vec::new();

    for effect in effects {
        match effect {
            CallEffect::Requires { lock, mode } => {
                if before.get(*lock) < *mode {
                    findings.push(Finding::new(
                        RuleKind::CallPreconditionViolation,
                        format!(
                            "call to `{callee}` requires `{}` {}",
                            locks.path(*lock),
                            requirement(*mode)
                        ),
                    ));
                }
            }

            CallEffect::Acquires(lock) => {
                let current = before.get(*lock);
                if current != LockMode::NotHeld {
                    findings.push(Finding::new(
                        RuleKind::AcquireViolation,
                        format!(
                            "call to `{callee}` acquires `{}`, which is already held ({current})",
                            locks.path(*lock)
                        ),
                    ));
                }
                state.set(*lock, LockMode::HeldExclusive);
            }

            CallEffect::Releases(lock) => {
                let current = before.get(*lock);
                if current != LockMode::HeldExclusive {
                    let path = locks.path(*lock);
                    findings.push(Finding::new(
                        RuleKind::CallPreconditionViolation,
                        format!("call to `{callee}` requires `{path}` held exclusively"),
                    ));
                    let held = match current {
                        LockMode::NotHeld => "not held".to_string(),
                        other => format!("held {other}"),
                    };
                    findings.push(Finding::new(
                        RuleKind::ReleaseViolation,
                        format!("call to `{callee}` releases `{path}`, which is {held}"),
                    ));
                }
                state.set(*lock, LockMode::NotHeld);
            }

            CallEffect::Unresolved { lock, reason } => {
                findings.push(Finding::new(
                    RuleKind::CallPreconditionViolation,
                    format!("call to `{callee}` names `{lock}`, which cannot be resolved here: {reason}"),
                ));
            }
        }
    }

    findings
}

// ============================================================================
// Exit
// ============================================================================

/// Compare the state at a return with the function's exit obligations.
/// Locks without an obligation must not be held.
pub fn check_exit(state: &LockState, locks: &LockTable, exit: &[(LockId, LockMode)]) -> Vec<Finding> {
    let expected: BTreeMap<LockId, LockMode> = exit.iter().copied().collect();
    let mut relevant: BTreeSet<LockId> = expected.keys().copied().collect();
    relevant.extend(state.held().map(|(lock, _)| lock));

    let mut findings = Vec::new();
    for lock in relevant {
        let want = expected.get(&lock).copied().unwrap_or(LockMode::NotHeld);
        let have = state.get(lock);
        let path = locks.path(lock);
        if have > want {
            findings.push(Finding::new(
                RuleKind::ExitStateViolation,
                format!("return with unexpected locks held: `{path}` ({have})"),
            ));
        } else if have < want {
            findings.push(Finding::new(
                RuleKind::ExitStateViolation,
                format!("return without required lock held: `{path}` (expected {want})"),
            ));
        }
    }
    findings
}
