//! Contract Registry
//!
//! Collects the lock and atomic contracts declared by directive comments on
//! struct fields and functions of one compilation unit. The registry is
//! built once, before any function body is analyzed, and is read-only
//! afterwards; per-function analyses share it by reference.
//!
//! A malformed or unresolvable annotation produces a ConfigurationError
//! diagnostic scoped to its declaration:
//! - a field with a bad annotation carries no contract;
//! - a function with a bad annotation has no contract and its body is not
//!   analyzed (it is recorded as *rejected*).

mod directive;

pub use directive::{DirectiveKind, parse_directive};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use crate::ast::{FnDef, Program, Span, StructDef, Type};
use crate::config::Config;
use crate::diagnostics::Diagnostic;
use crate::resolve::{self, Layouts, ResolveError};

// ============================================================================
// Lock vocabulary
// ============================================================================

/// What modes a lock type supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LockKind {
    /// Mutex: exclusive only
    Exclusive,
    /// Reader/writer lock: exclusive or shared
    ReadWrite,
}

/// How a lock is held at a program point. Ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum LockMode {
    NotHeld,
    HeldShared,
    HeldExclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::NotHeld => write!(f, "not held"),
            LockMode::HeldShared => write!(f, "shared"),
            LockMode::HeldExclusive => write!(f, "exclusive"),
        }
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Identity of a function: methods are keyed by receiver type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FnKey {
    Method { owner: String, name: String },
    Free(String),
}

impl FnKey {
    pub fn of(fn_def: &FnDef) -> Self {
        match &fn_def.receiver {
            Some(recv) => FnKey::Method {
                owner: recv.ty.node.base_name().to_string(),
                name: fn_def.name.node.clone(),
            },
            None => FnKey::Free(fn_def.name.node.clone()),
        }
    }
}

impl fmt::Display for FnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FnKey::Method { owner, name } => write!(f, "{owner}.{name}"),
            FnKey::Free(name) => write!(f, "{name}"),
        }
    }
}

/// Struct layout used for field-chain resolution
#[derive(Debug, Clone)]
pub struct StructInfo {
    pub name: String,
    pub fields: Vec<(String, Type)>,
    pub span: Span,
}

impl StructInfo {
    fn from_def(def: &StructDef) -> Self {
        Self {
            name: def.name.node.clone(),
            fields: def
                .fields
                .iter()
                .map(|f| (f.name.node.clone(), f.ty.node.clone()))
                .collect(),
            span: def.span,
        }
    }

    pub fn field_type(&self, field: &str) -> Option<&Type> {
        self.fields.iter().find(|(name, _)| name == field).map(|(_, ty)| ty)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|(name, _)| name.as_str()).collect()
    }
}

// ============================================================================
// Contracts
// ============================================================================

/// Lock named by a field contract, relative to the struct instance that
/// owns the field (`+checklocks:mu` → `["mu"]`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLock {
    pub path: Vec<String>,
    pub kind: LockKind,
}

/// Contract attached to a struct field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldContract {
    /// `+checklocks:<lock>`
    Guarded(FieldLock),
    /// `+checkatomic`
    AtomicOnly,
    /// `+checkatomic` together with `+checklocks:<lock>`
    Mixed(FieldLock),
}

impl FieldContract {
    pub fn lock(&self) -> Option<&FieldLock> {
        match self {
            FieldContract::Guarded(lock) | FieldContract::Mixed(lock) => Some(lock),
            FieldContract::AtomicOnly => None,
        }
    }
}

impl fmt::Display for FieldContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldContract::Guarded(lock) => write!(f, "guarded by {}", lock.path.join(".")),
            FieldContract::AtomicOnly => write!(f, "atomic only"),
            FieldContract::Mixed(lock) => {
                write!(f, "atomic writes under {0}, reads atomic or under {0}", lock.path.join("."))
            }
        }
    }
}

/// Where a function contract's lock expression starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBase {
    Receiver,
    Param(usize),
}

/// Lock named by a function contract, rooted at the receiver or a parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractLock {
    pub base: LockBase,
    pub base_name: String,
    pub fields: Vec<String>,
    pub kind: LockKind,
}

impl ContractLock {
    /// Canonical path inside the declaring function (`pr.mu`)
    pub fn path(&self) -> Vec<String> {
        let mut path = vec![self.base_name.clone()];
        path.extend(self.fields.iter().cloned());
        path
    }
}

impl fmt::Display for ContractLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().join("."))
    }
}

/// One lock obligation of a function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEffect {
    /// Precondition only: lock held in `mode` on entry, unchanged on exit
    Requires { lock: ContractLock, mode: LockMode },
    /// Not held on entry, held exclusively on exit
    Acquires(ContractLock),
    /// Held exclusively on entry, not held on exit
    Releases(ContractLock),
}

impl LockEffect {
    pub fn lock(&self) -> &ContractLock {
        match self {
            LockEffect::Requires { lock, .. } | LockEffect::Acquires(lock) | LockEffect::Releases(lock) => lock,
        }
    }

    /// Mode the caller must hold the lock in
    pub fn entry_mode(&self) -> LockMode {
        match self {
            LockEffect::Requires { mode, .. } => *mode,
            LockEffect::Acquires(_) => LockMode::NotHeld,
            LockEffect::Releases(_) => LockMode::HeldExclusive,
        }
    }

    /// Mode the lock is in when the function returns
    pub fn exit_mode(&self) -> LockMode {
        match self {
            LockEffect::Requires { mode, .. } => *mode,
            LockEffect::Acquires(_) => LockMode::HeldExclusive,
            LockEffect::Releases(_) => LockMode::NotHeld,
        }
    }
}

impl fmt::Display for LockEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockEffect::Requires { lock, mode: LockMode::HeldShared } => write!(f, "requires {lock} (shared)"),
            LockEffect::Requires { lock, .. } => write!(f, "requires {lock}"),
            LockEffect::Acquires(lock) => write!(f, "acquires {lock}"),
            LockEffect::Releases(lock) => write!(f, "releases {lock}"),
        }
    }
}

/// Contract attached to a function
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionContract {
    pub effects: Vec<LockEffect>,
    /// `+checklocksignore`: the body is not analyzed
    pub ignored: bool,
}

// ============================================================================
// Registry
// ============================================================================

/// Immutable table of every contract in a compilation unit
#[derive(Debug, Default)]
pub struct Registry {
    structs: Layouts,
    fields: HashMap<String, BTreeMap<String, FieldContract>>,
    functions: HashMap<FnKey, FunctionContract>,
    rejected: HashSet<FnKey>,
    /// Declared result types, annotated or not
    returns: HashMap<FnKey, Type>,
}

impl Registry {
    /// Build the registry, returning it with any ConfigurationError diagnostics
    pub fn build(program: &Program, config: &Config) -> (Self, Vec<Diagnostic>) {
        let mut builder = Builder {
            registry: Registry::default(),
            config,
            diagnostics: Vec::new(),
        };

        for def in program.structs() {
            if builder.registry.structs.contains_key(&def.name.node) {
                builder.error(def.name.span, format!("duplicate struct `{}`", def.name.node));
                continue;
            }
            builder
                .registry
                .structs
                .insert(def.name.node.clone(), StructInfo::from_def(def));
        }

        for def in program.structs() {
            builder.register_fields(def);
        }
        for def in program.functions() {
            if let Some(ret) = &def.ret_ty {
                builder.registry.returns.insert(FnKey::of(def), ret.node.clone());
            }
            builder.register_function(def);
        }

        let Builder {
            registry, diagnostics, ..
        } = builder;
        debug!(
            structs = registry.structs.len(),
            fields = registry.fields.values().map(BTreeMap::len).sum::<usize>(),
            functions = registry.functions.len(),
            rejected = registry.rejected.len(),
            errors = diagnostics.len(),
            "contract registry built"
        );
        (registry, diagnostics)
    }

    pub fn layouts(&self) -> &Layouts {
        &self.structs
    }

    pub fn struct_info(&self, name: &str) -> Option<&StructInfo> {
        self.structs.get(name)
    }

    pub fn field_contract(&self, owner: &str, field: &str) -> Option<&FieldContract> {
        self.fields.get(owner)?.get(field)
    }

    pub fn function_contract(&self, key: &FnKey) -> Option<&FunctionContract> {
        self.functions.get(key)
    }

    /// Declared result type of a function or method
    pub fn return_type(&self, key: &FnKey) -> Option<&Type> {
        self.returns.get(key)
    }

    /// Whether the function's own annotations failed to register
    pub fn is_rejected(&self, key: &FnKey) -> bool {
        self.rejected.contains(key)
    }

    /// Human-readable listing of all contracts, sorted
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let mut owners: Vec<_> = self.fields.keys().collect();
        owners.sort();
        for owner in owners {
            for (field, contract) in &self.fields[owner] {
                out.push_str(&format!("field {owner}.{field}: {contract}\n"));
            }
        }
        let mut functions: Vec<_> = self.functions.iter().collect();
        functions.sort_by(|a, b| a.0.cmp(b.0));
        for (key, contract) in functions {
            let mut parts: Vec<String> = contract.effects.iter().map(|e| e.to_string()).collect();
            if contract.ignored {
                parts.push("ignored".to_string());
            }
            out.push_str(&format!("fn {key}: {}\n", parts.join(", ")));
        }
        let mut rejected: Vec<_> = self.rejected.iter().collect();
        rejected.sort();
        for key in rejected {
            out.push_str(&format!("fn {key}: rejected\n"));
        }
        out
    }
}

struct Builder<'a> {
    registry: Registry,
    config: &'a Config,
    diagnostics: Vec<Diagnostic>,
}

impl Builder<'_> {
    fn error(&mut self, span: Span, message: String) {
        warn!(%message, "configuration error");
        self.diagnostics.push(Diagnostic::configuration(span, message));
    }

    fn register_fields(&mut self, def: &StructDef) {
        let owner = &def.name.node;
        let self_ty = Type::named(owner.clone());

        for field in &def.fields {
            let mut guard: Option<FieldLock> = None;
            let mut atomic = false;
            let mut failed = false;

            for directive in &field.directives {
                let kind = match parse_directive(&directive.node.text) {
                    None => continue,
                    Some(Ok(kind)) => kind,
                    Some(Err(message)) => {
                        self.error(directive.span, message);
                        failed = true;
                        continue;
                    }
                };
                match kind {
                    DirectiveKind::Guard(expr) => {
                        if guard.is_some() {
                            self.error(
                                directive.span,
                                format!("field `{owner}.{}` is already guarded by a lock", field.name.node),
                            );
                            failed = true;
                            continue;
                        }
                        match self.resolve_field_lock(&self_ty, &expr) {
                            Ok(lock) => guard = Some(lock),
                            Err(err) => {
                                self.error(directive.span, format!("invalid lock expression `{expr}`: {err}"));
                                failed = true;
                            }
                        }
                    }
                    DirectiveKind::Atomic => atomic = true,
                    other => {
                        self.error(
                            directive.span,
                            format!("`{}` cannot annotate a field", other.name()),
                        );
                        failed = true;
                    }
                }
            }

            if failed {
                continue;
            }
            let contract = match (guard, atomic) {
                (Some(lock), true) => FieldContract::Mixed(lock),
                (Some(lock), false) => FieldContract::Guarded(lock),
                (None, true) => FieldContract::AtomicOnly,
                (None, false) => continue,
            };
            self.registry
                .fields
                .entry(owner.clone())
                .or_default()
                .insert(field.name.node.clone(), contract);
        }
    }

    fn resolve_field_lock(&self, owner: &Type, expr: &str) -> Result<FieldLock, ResolveError> {
        let path = resolve::split_lock_expr(expr)?;
        let ty = resolve::resolve_chain(&self.registry.structs, owner, &path)?;
        let kind = resolve::lock_kind(self.config, &ty, &path.join("."))?;
        Ok(FieldLock { path, kind })
    }

    fn register_function(&mut self, def: &FnDef) {
        let key = FnKey::of(def);
        if self.registry.functions.contains_key(&key) || self.registry.rejected.contains(&key) {
            self.error(def.name.span, format!("duplicate function `{key}`"));
            return;
        }

        let mut contract = FunctionContract::default();
        let mut failed = false;

        for directive in &def.directives {
            let kind = match parse_directive(&directive.node.text) {
                None => continue,
                Some(Ok(kind)) => kind,
                Some(Err(message)) => {
                    self.error(directive.span, message);
                    failed = true;
                    continue;
                }
            };
            let (expr, make): (String, fn(ContractLock) -> LockEffect) = match kind {
                DirectiveKind::Guard(expr) => (expr, |lock| LockEffect::Requires {
                    lock,
                    mode: LockMode::HeldExclusive,
                }),
                DirectiveKind::Read(expr) => (expr, |lock| LockEffect::Requires {
                    lock,
                    mode: LockMode::HeldShared,
                }),
                DirectiveKind::Acquire(expr) => (expr, LockEffect::Acquires),
                DirectiveKind::Release(expr) => (expr, LockEffect::Releases),
                DirectiveKind::Ignore => {
                    contract.ignored = true;
                    continue;
                }
                other => {
                    self.error(
                        directive.span,
                        format!("`{}` cannot annotate a function", other.name()),
                    );
                    failed = true;
                    continue;
                }
            };

            let lock = match resolve::resolve_signature_lock(&self.registry.structs, self.config, def, &expr) {
                Ok(lock) => lock,
                Err(err) => {
                    self.error(directive.span, format!("invalid lock expression `{expr}`: {err}"));
                    failed = true;
                    continue;
                }
            };

            let effect = make(lock);
            if let Some(existing) = contract.effects.iter().find(|e| e.lock() == effect.lock()) {
                let message = format!(
                    "conflicting annotations on `{key}`: `{effect}` and `{existing}` name the same lock"
                );
                self.error(directive.span, message);
                failed = true;
                continue;
            }
            contract.effects.push(effect);
        }

        if failed {
            self.registry.rejected.insert(key);
            return;
        }
        if contract.ignored || !contract.effects.is_empty() {
            self.registry.functions.insert(key, contract);
        }
    }
}
