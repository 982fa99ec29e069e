//! Function-scope resolution
//!
//! Turns a [`MirFunction`] into a [`ResolvedFunction`]: every place gets a
//! type through the binding environment, field accesses are matched with
//! their contracts, lock method calls become lock operations, and calls to
//! contract-bearing functions carry their effects with the callee's lock
//! expressions rewritten into the caller's scope.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::ast::{Span, Type};
use crate::config::Config;
use crate::contract::{FieldContract, FnKey, LockBase, LockEffect, LockKind, LockMode, Registry};
use crate::diagnostics::Diagnostic;
use crate::mir::{AccessKind, BindInit, Callee, MirFunction, MirInst, Terminator, display_place, source_name};
use crate::util::did_you_mean;

use super::{Layouts, LockId, LockTable, ResolveError, lock_kind, resolve_chain, split_lock_expr};

/// Which field rule applies to an access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    Guarded,
    AtomicOnly,
    Mixed,
}

/// Direct lock method call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Acquire(LockMode),
    Release(LockMode),
}

/// Callee effect rewritten into the caller's scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEffect {
    Requires { lock: LockId, mode: LockMode },
    Acquires(LockId),
    Releases(LockId),
    /// The callee's lock cannot be named from the call site
    Unresolved { lock: String, reason: String },
}

/// One analysis event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Access to a field with a contract
    Access {
        place: String,
        rule: FieldRule,
        lock: Option<LockId>,
        kind: AccessKind,
        atomic: bool,
        span: Span,
    },
    LockOp { lock: LockId, op: LockOp, span: Span },
    Call {
        callee: String,
        effects: Vec<CallEffect>,
        span: Span,
    },
    Force { lock: LockId, span: Span },
}

#[derive(Debug, Clone)]
pub struct ResolvedBlock {
    pub steps: Vec<Step>,
    pub terminator: Terminator,
}

/// A function ready for lock-state propagation
#[derive(Debug, Clone)]
pub struct ResolvedFunction {
    pub name: String,
    pub blocks: Vec<ResolvedBlock>,
    pub locks: LockTable,
    /// Lock modes assumed on entry
    pub entry: Vec<(LockId, LockMode)>,
    /// Lock modes required at every return
    pub exit: Vec<(LockId, LockMode)>,
}

// ============================================================================
// Bindings
// ============================================================================

/// Names in scope with their declared or inferred types. Lowering gives
/// every shadowing `let` its own name, so one flat table covers the whole
/// function. A name mapped to `None` is a local whose type is unknown.
#[derive(Debug, Clone)]
pub struct Bindings<'a> {
    layouts: &'a Layouts,
    scope: String,
    types: HashMap<String, Option<Type>>,
}

impl<'a> Bindings<'a> {
    pub fn new(layouts: &'a Layouts, scope: impl Into<String>) -> Self {
        Self {
            layouts,
            scope: scope.into(),
            types: HashMap::new(),
        }
    }

    pub fn bind(&mut self, name: impl Into<String>, ty: Option<Type>) {
        self.types.insert(name.into(), ty);
    }

    /// Bound, but with no type to resolve fields through
    pub fn is_untyped(&self, name: &str) -> bool {
        matches!(self.types.get(name), Some(None))
    }

    /// Type of a place path, or why it has none
    pub fn resolve(&self, path: &[String]) -> Result<Type, ResolveError> {
        let (base, fields) = path.split_first().ok_or(ResolveError::Empty)?;
        match self.types.get(base) {
            Some(Some(base_ty)) => resolve_chain(self.layouts, base_ty, fields),
            Some(None) => Err(ResolveError::Untyped {
                name: source_name(base).to_string(),
            }),
            None => {
                let name = source_name(base);
                Err(ResolveError::UnknownBase {
                    name: name.to_string(),
                    scope: self.scope.clone(),
                    hint: did_you_mean(name, self.types.keys().map(|key| source_name(key))),
                })
            }
        }
    }

    pub fn type_of(&self, path: &[String]) -> Option<Type> {
        self.resolve(path).ok()
    }
}

// ============================================================================
// Resolution
// ============================================================================

struct ScopeResolver<'a> {
    registry: &'a Registry,
    config: &'a Config,
    bindings: Bindings<'a>,
    locks: LockTable,
    /// Untyped locals already reported
    untyped: HashSet<String>,
    diagnostics: Vec<Diagnostic>,
}

/// Resolve one function against the registry
pub fn resolve_function(mir: &MirFunction, registry: &Registry, config: &Config) -> (ResolvedFunction, Vec<Diagnostic>) {
    let name = mir.key.to_string();
    let mut resolver = ScopeResolver {
        registry,
        config,
        bindings: Bindings::new(registry.layouts(), name.clone()),
        locks: LockTable::new(),
        untyped: HashSet::new(),
        diagnostics: Vec::new(),
    };
    for (param, ty) in mir.receiver.iter().chain(mir.params.iter()) {
        resolver.bindings.bind(param.clone(), Some(ty.clone()));
    }

    let mut entry = Vec::new();
    let mut exit = Vec::new();
    if let Some(contract) = registry.function_contract(&mir.key) {
        for effect in &contract.effects {
            let lock = effect.lock();
            let id = resolver.locks.intern(&lock.path(), lock.kind);
            entry.push((id, effect.entry_mode()));
            exit.push((id, effect.exit_mode()));
        }
    }

    // Unreachable blocks keep no steps; they are never analyzed
    let mut steps: Vec<Vec<Step>> = vec![Vec::new(); mir.blocks.len()];
    for id in mir.reverse_postorder() {
        for inst in &mir.block(id).instructions {
            resolver.resolve_inst(inst, &mut steps[id.0]);
        }
    }

    let blocks = steps
        .into_iter()
        .zip(&mir.blocks)
        .map(|(steps, block)| ResolvedBlock {
            steps,
            terminator: block.terminator.clone(),
        })
        .collect();

    trace!(function = %name, locks = resolver.locks.len(), "resolved function scope");
    let resolved = ResolvedFunction {
        name,
        blocks,
        locks: resolver.locks,
        entry,
        exit,
    };
    (resolved, resolver.diagnostics)
}

impl ScopeResolver<'_> {
    fn resolve_inst(&mut self, inst: &MirInst, steps: &mut Vec<Step>) {
        match inst {
            MirInst::Bind { name, ty, init } => {
                let ty = ty.clone().or_else(|| match init {
                    BindInit::Place(path) => self.bindings.type_of(path),
                    BindInit::Ref(path) => self.bindings.type_of(path).map(|t| Type::Ptr(Box::new(t))),
                    BindInit::Struct(name) => Some(Type::named(name.clone())),
                    BindInit::Call(callee) => self.result_type(callee),
                    BindInit::Opaque => None,
                });
                self.bindings.bind(name.clone(), ty);
            }

            MirInst::Access {
                place,
                kind,
                atomic,
                span,
            } => self.resolve_access(place, *kind, *atomic, *span, steps),

            MirInst::Call { callee, args, span } => self.resolve_call(callee, args, *span, steps),

            MirInst::Force { lock, base, span } => match self.resolve_local_lock(lock, base.as_deref()) {
                Ok(id) => steps.push(Step::Force { lock: id, span: *span }),
                Err(err) => self.diagnostics.push(Diagnostic::configuration(
                    *span,
                    format!("invalid lock expression `{lock}`: {err}"),
                )),
            },
        }
    }

    /// Emit a step for every field along `place` that carries a contract.
    /// Intermediate fields are read; only the last one takes `kind`.
    fn resolve_access(&mut self, place: &[String], kind: AccessKind, atomic: bool, span: Span, steps: &mut Vec<Step>) {
        let Some(base) = place.first() else {
            return;
        };
        let Some(mut ty) = self.bindings.type_of(std::slice::from_ref(base)) else {
            if place.len() > 1 {
                self.report_untyped(place, span);
            }
            return;
        };

        for (i, field) in place.iter().enumerate().skip(1) {
            let owner = ty.base_name();
            let Some(next) = self.registry.struct_info(owner).and_then(|info| info.field_type(field)) else {
                trace!(place = %place.join("."), "access path leaves known struct layouts");
                return;
            };

            if let Some(contract) = self.registry.field_contract(owner, field) {
                let (rule, field_lock) = match contract {
                    FieldContract::Guarded(lock) => (FieldRule::Guarded, Some(lock)),
                    FieldContract::AtomicOnly => (FieldRule::AtomicOnly, None),
                    FieldContract::Mixed(lock) => (FieldRule::Mixed, Some(lock)),
                };
                let lock = field_lock.map(|lock| {
                    let mut path = place[..i].to_vec();
                    path.extend(lock.path.iter().cloned());
                    self.locks.intern(&path, lock.kind)
                });
                let last = i + 1 == place.len();
                steps.push(Step::Access {
                    place: display_place(&place[..=i]),
                    rule,
                    lock,
                    kind: if last { kind } else { AccessKind::Read },
                    atomic: last && atomic,
                    span,
                });
            }

            ty = next.clone();
        }
    }

    fn resolve_call(&mut self, callee: &Callee, args: &[Option<Vec<String>>], span: Span, steps: &mut Vec<Step>) {
        let (key, receiver) = match callee {
            Callee::Method { receiver, name } => {
                // Unbound receiver: a package function, outside the analysis
                let Some(receiver_ty) = self.bindings.type_of(receiver) else {
                    self.report_untyped(receiver, span);
                    return;
                };
                if let Some(kind) = self.config.lock_kind(receiver_ty.base_name()) {
                    self.resolve_lock_op(receiver, kind, name, span, steps);
                    return;
                }
                let key = FnKey::Method {
                    owner: receiver_ty.base_name().to_string(),
                    name: name.clone(),
                };
                (key, Some(receiver.as_slice()))
            }
            Callee::Function(name) => (FnKey::Free(name.clone()), None),
        };

        let Some(contract) = self.registry.function_contract(&key) else {
            return;
        };
        let effects: Vec<CallEffect> = contract
            .effects
            .iter()
            .map(|effect| self.rewrite_effect(effect, receiver, args))
            .collect();
        if !effects.is_empty() {
            steps.push(Step::Call {
                callee: key.to_string(),
                effects,
                span,
            });
        }
    }

    /// Declared result type of the function a `let` is initialized from
    fn result_type(&self, callee: &Callee) -> Option<Type> {
        let key = match callee {
            Callee::Method { receiver, name } => FnKey::Method {
                owner: self.bindings.type_of(receiver)?.base_name().to_string(),
                name: name.clone(),
            },
            Callee::Function(name) => FnKey::Free(name.clone()),
        };
        self.registry.return_type(&key).cloned()
    }

    /// A place rooted at a local of unknown type cannot be checked; say so
    /// once per local instead of skipping it silently
    fn report_untyped(&mut self, place: &[String], span: Span) {
        let Some(base) = place.first() else {
            return;
        };
        if !self.bindings.is_untyped(base) || !self.untyped.insert(base.clone()) {
            return;
        }
        let err = ResolveError::Untyped {
            name: source_name(base).to_string(),
        };
        self.diagnostics.push(Diagnostic::configuration(
            span,
            format!("cannot check `{}`: {err}", display_place(place)),
        ));
    }

    fn resolve_lock_op(&mut self, receiver: &[String], kind: LockKind, method: &str, span: Span, steps: &mut Vec<Step>) {
        let locks = &self.config.locks;
        let named = |names: &[String]| names.iter().any(|n| n == method);
        let shared = kind == LockKind::ReadWrite;

        let op = if named(&locks.acquire) {
            LockOp::Acquire(LockMode::HeldExclusive)
        } else if named(&locks.release) {
            LockOp::Release(LockMode::HeldExclusive)
        } else if shared && named(&locks.shared_acquire) {
            LockOp::Acquire(LockMode::HeldShared)
        } else if shared && named(&locks.shared_release) {
            LockOp::Release(LockMode::HeldShared)
        } else {
            trace!(lock = %receiver.join("."), method, "lock method with no state effect");
            return;
        };

        let lock = self.locks.intern(receiver, kind);
        steps.push(Step::LockOp { lock, op, span });
    }

    /// Substitute the callee's receiver/parameter with the caller's
    /// receiver expression/argument
    fn rewrite_effect(&mut self, effect: &LockEffect, receiver: Option<&[String]>, args: &[Option<Vec<String>>]) -> CallEffect {
        let lock = effect.lock();
        let base = match lock.base {
            LockBase::Receiver => receiver.ok_or_else(|| "no receiver at this call".to_string()),
            LockBase::Param(index) => match args.get(index) {
                Some(Some(place)) => Ok(place.as_slice()),
                Some(None) => Err(format!("argument {} is not a place expression", index + 1)),
                None => Err(format!("argument {} is missing", index + 1)),
            },
        };
        let base = match base {
            Ok(base) => base,
            Err(reason) => {
                return CallEffect::Unresolved {
                    lock: lock.to_string(),
                    reason,
                };
            }
        };

        let mut path = base.to_vec();
        path.extend(lock.fields.iter().cloned());
        let id = self.locks.intern(&path, lock.kind);
        match effect {
            LockEffect::Requires { mode, .. } => CallEffect::Requires { lock: id, mode: *mode },
            LockEffect::Acquires(_) => CallEffect::Acquires(id),
            LockEffect::Releases(_) => CallEffect::Releases(id),
        }
    }

    /// Resolve a force directive's lock expression in the function body.
    /// `base` replaces the first segment when it names a shadowing local.
    fn resolve_local_lock(&mut self, expr: &str, base: Option<&str>) -> Result<LockId, ResolveError> {
        let mut path = split_lock_expr(expr)?;
        if let (Some(base), Some(first)) = (base, path.first_mut()) {
            *first = base.to_string();
        }
        let ty = self.bindings.resolve(&path)?;
        let kind = lock_kind(self.config, &ty, expr.trim())?;
        Ok(self.locks.intern(&path, kind))
    }
}
