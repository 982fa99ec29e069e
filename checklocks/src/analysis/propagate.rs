//! Forward lock-state propagation
//!
//! Two passes over a resolved function:
//! 1. a worklist fixpoint computing the lock state on entry to every
//!    reachable block, joining at merge points;
//! 2. a reporting pass replaying each block from its fixed entry state and
//!    running the checkers, so every finding is reported exactly once.

use std::collections::VecDeque;

use tracing::trace;

use crate::ast::Span;
use crate::config::Config;
use crate::diagnostics::Diagnostic;
use crate::mir::Terminator;
use crate::resolve::{ResolvedFunction, Step};

use super::LockState;
use super::check::{FieldAccess, Finding, apply_call, apply_force, apply_lock_op, check_access, check_exit};

/// Where findings go during a block transfer
trait Sink {
    fn report(&mut self, state: &LockState, span: Span, findings: Vec<Finding>);
}

/// Fixpoint pass: findings are dropped
struct Discard;

impl Sink for Discard {
    fn report(&mut self, _: &LockState, _: Span, _: Vec<Finding>) {}
}

/// Reporting pass: findings become diagnostics with a held-lock snapshot
struct Collect<'a> {
    func: &'a ResolvedFunction,
    diagnostics: Vec<Diagnostic>,
}

impl Sink for Collect<'_> {
    fn report(&mut self, state: &LockState, span: Span, findings: Vec<Finding>) {
        if findings.is_empty() {
            return;
        }
        let held = state.snapshot(&self.func.locks);
        for finding in findings {
            self.diagnostics
                .push(Diagnostic::new(finding.rule, span, finding.message, held.clone()));
        }
    }
}

/// Advance `state` through one step
fn transfer_step(func: &ResolvedFunction, config: &Config, state: &mut LockState, step: &Step, sink: &mut impl Sink) {
    match step {
        Step::Access {
            place,
            rule,
            lock,
            kind,
            atomic,
            span,
        } => {
            let access = FieldAccess {
                place,
                rule: *rule,
                lock: *lock,
                kind: *kind,
                atomic: *atomic,
            };
            let findings = check_access(state, &func.locks, access, config.analysis.shared_reads);
            sink.report(state, *span, findings);
        }
        Step::LockOp { lock, op, span } => {
            let before = state.clone();
            let findings = apply_lock_op(state, &func.locks, *lock, *op);
            sink.report(&before, *span, findings);
        }
        Step::Call { callee, effects, span } => {
            let before = state.clone();
            let findings = apply_call(state, &func.locks, callee, effects);
            sink.report(&before, *span, findings);
        }
        Step::Force { lock, .. } => apply_force(state, *lock),
    }
}

fn transfer_block(func: &ResolvedFunction, config: &Config, block: usize, entry: &LockState, sink: &mut impl Sink) -> LockState {
    let mut state = entry.clone();
    for step in &func.blocks[block].steps {
        transfer_step(func, config, &mut state, step, sink);
    }
    state
}

fn successors(terminator: &Terminator) -> Vec<usize> {
    terminator.successors().into_iter().map(|b| b.0).collect()
}

/// Lock state on entry to each block; `None` for unreachable blocks
pub fn fixpoint(func: &ResolvedFunction, config: &Config, entry: LockState) -> Vec<Option<LockState>> {
    let mut states: Vec<Option<LockState>> = vec![None; func.blocks.len()];
    if func.blocks.is_empty() {
        return states;
    }
    states[0] = Some(entry);

    let mut worklist = VecDeque::from([0usize]);
    let mut queued = vec![false; func.blocks.len()];
    queued[0] = true;
    let mut iterations = 0usize;

    while let Some(block) = worklist.pop_front() {
        queued[block] = false;
        iterations += 1;
        let Some(input) = states[block].clone() else {
            continue;
        };
        let output = transfer_block(func, config, block, &input, &mut Discard);

        for succ in successors(&func.blocks[block].terminator) {
            let joined = match &states[succ] {
                Some(existing) => existing.join(&output),
                None => output.clone(),
            };
            // Joins only ever drop or weaken locks, so this terminates
            if states[succ].as_ref() != Some(&joined) {
                states[succ] = Some(joined);
                if !queued[succ] {
                    queued[succ] = true;
                    worklist.push_back(succ);
                }
            }
        }
    }

    trace!(function = %func.name, iterations, "lock state fixpoint reached");
    states
}

/// Analyze one resolved function, returning its findings
pub fn propagate(func: &ResolvedFunction, config: &Config) -> Vec<Diagnostic> {
    let mut entry = LockState::new();
    for &(lock, mode) in &func.entry {
        entry.set(lock, mode);
    }

    let states = fixpoint(func, config, entry);
    let mut sink = Collect {
        func,
        diagnostics: Vec::new(),
    };

    for (block, state) in states.iter().enumerate() {
        let Some(state) = state else {
            continue;
        };
        let exit_state = transfer_block(func, config, block, state, &mut sink);
        if let Terminator::Return { span } = func.blocks[block].terminator {
            let findings = check_exit(&exit_state, &func.locks, &func.exit);
            sink.report(&exit_state, span, findings);
        }
    }

    sink.diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{LockMode, Registry};
    use crate::diagnostics::RuleKind;
    use crate::lexer::tokenize;
    use crate::mir::lower_function;
    use crate::parser::parse;
    use crate::resolve::resolve_function;

    const STRUCTS: &str = "
        struct Resource {
            mu: sync.Mutex,
            // +checklocks:mu
            value: int,
            rwMu: sync.RWMutex,
            // +checklocks:rwMu
            shared: int,
        }
    ";

    /// Diagnostics for the last function in `body`
    fn run(body: &str) -> Vec<Diagnostic> {
        let source = format!("{STRUCTS}\n{body}");
        let program = parse("test.ck", &source, tokenize(&source).unwrap()).unwrap();
        let config = Config::default();
        let (registry, diags) = Registry::build(&program, &config);
        assert!(diags.is_empty(), "{diags:?}");
        let def = program.functions().last().unwrap();
        let (mir, _) = lower_function(def, &config);
        let (func, _) = resolve_function(&mir, &registry, &config);
        propagate(&func, &config)
    }

    fn rules(diags: &[Diagnostic]) -> Vec<RuleKind> {
        diags.iter().map(|d| d.rule).collect()
    }

    #[test]
    fn test_locked_write_is_clean() {
        let diags = run("fn (pr: *Resource) f() { pr.mu.Lock(); pr.value = 1; pr.mu.Unlock(); }");
        assert!(diags.is_empty(), "{diags:?}");
    }

    #[test]
    fn test_unlocked_write_reports_once() {
        let diags = run("fn (pr: *Resource) f() { pr.value = 1; pr.value = 2; }");
        assert_eq!(rules(&diags), vec![RuleKind::AccessViolation, RuleKind::AccessViolation]);
        assert_eq!(diags[0].held_description(), "no locks held");
    }

    #[test]
    fn test_lock_on_one_branch_only() {
        let diags = run(
            "fn (pr: *Resource) f(c: bool) {
                if c { pr.mu.Lock(); }
                pr.value = 1;
                if c { pr.mu.Unlock(); }
            }",
        );
        // Not held after the join; the second branch then releases a lock
        // that is not held on every path
        assert_eq!(rules(&diags), vec![RuleKind::AccessViolation, RuleKind::ReleaseViolation]);
    }

    #[test]
    fn test_lock_on_both_branches() {
        let diags = run(
            "fn (pr: *Resource) f(c: bool) {
                if c { pr.mu.Lock(); } else { pr.mu.Lock(); }
                pr.value = 1;
                pr.mu.Unlock();
            }",
        );
        assert!(diags.is_empty(), "{diags:?}");
    }

    #[test]
    fn test_loop_reaches_fixpoint() {
        let diags = run(
            "fn (pr: *Resource) f(c: bool) {
                pr.mu.Lock();
                while c {
                    pr.value = 1;
                    pr.mu.Unlock();
                    pr.mu.Lock();
                }
                pr.mu.Unlock();
            }",
        );
        assert!(diags.is_empty(), "{diags:?}");
    }

    #[test]
    fn test_loop_releasing_without_reacquire() {
        let diags = run(
            "fn (pr: *Resource) f(c: bool) {
                pr.mu.Lock();
                while c {
                    pr.value = 1;
                    pr.mu.Unlock();
                }
            }",
        );
        // Once the body has run, the lock is not held on every path into it
        assert!(rules(&diags).contains(&RuleKind::AccessViolation));
        assert!(rules(&diags).contains(&RuleKind::ReleaseViolation));
    }

    #[test]
    fn test_return_holding_lock() {
        let diags = run("fn (pr: *Resource) f() { pr.mu.Lock(); return; }");
        assert_eq!(rules(&diags), vec![RuleKind::ExitStateViolation]);
        assert!(diags[0].message.contains("unexpected locks held"));
        assert_eq!(diags[0].held_description(), "pr.mu (exclusive)");
    }

    #[test]
    fn test_requires_contract_seeds_entry() {
        let diags = run(
            "// +checklocks:pr.mu
             fn (pr: *Resource) f() { pr.value = 1; }",
        );
        assert!(diags.is_empty(), "{diags:?}");
    }

    #[test]
    fn test_releasing_required_lock_fails_exit() {
        let diags = run(
            "// +checklocks:pr.mu
             fn (pr: *Resource) f() { pr.mu.Unlock(); }",
        );
        assert_eq!(rules(&diags), vec![RuleKind::ExitStateViolation]);
        assert!(diags[0].message.contains("without required lock held"));
    }

    #[test]
    fn test_acquire_contract_checks_exit() {
        let ok = run(
            "// +checklocksacquire:pr.mu
             fn (pr: *Resource) f() { pr.mu.Lock(); }",
        );
        assert!(ok.is_empty(), "{ok:?}");

        let missing = run(
            "// +checklocksacquire:pr.mu
             fn (pr: *Resource) f() { }",
        );
        assert_eq!(rules(&missing), vec![RuleKind::ExitStateViolation]);
    }

    #[test]
    fn test_force_then_unreleased_exit() {
        let diags = run(
            "fn (pr: *Resource) f() {
                // +checklocksforce:pr.mu
                pr.value = 1;
            }",
        );
        assert_eq!(rules(&diags), vec![RuleKind::ExitStateViolation]);
    }

    #[test]
    fn test_shared_hold_and_double_acquire() {
        let diags = run(
            "fn (pr: *Resource) f() {
                pr.rwMu.RLock();
                pr.rwMu.Lock();
                pr.rwMu.RUnlock();
            }",
        );
        assert_eq!(rules(&diags), vec![RuleKind::AcquireViolation]);
        assert_eq!(diags[0].held[0].mode, LockMode::HeldShared);
    }

    #[test]
    fn test_unreachable_code_not_checked() {
        let diags = run("fn (pr: *Resource) f() { return; pr.value = 1; }");
        assert!(diags.is_empty(), "{diags:?}");
    }

    #[test]
    fn test_defer_unlock() {
        let diags = run(
            "fn (pr: *Resource) f(c: bool) -> int {
                pr.mu.Lock();
                defer pr.mu.Unlock();
                if c { return 0; }
                return pr.value;
            }",
        );
        assert!(diags.is_empty(), "{diags:?}");
    }
}
