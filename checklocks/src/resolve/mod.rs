//! Lock Expression Resolver
//!
//! Lock expressions are dotted paths (`pr.mu`, `inner.rwMu`). Resolution is
//! purely syntactic: the first segment is a binding (receiver, parameter or
//! local) or, for field contracts, a field of the declaring struct; the rest
//! is a field chain walked through the struct layouts. No alias tracking is
//! done, so two spellings of the same runtime lock are distinct locks.

mod scope;

pub use scope::{
    Bindings, CallEffect, FieldRule, LockOp, ResolvedBlock, ResolvedFunction, Step, resolve_function,
};

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::ast::{FnDef, Type};
use crate::config::Config;
use crate::contract::{ContractLock, LockBase, LockKind, StructInfo};
use crate::mir::display_place;
use crate::util::did_you_mean;

/// Struct layouts by name
pub type Layouts = HashMap<String, StructInfo>;

/// Why a lock expression does not resolve
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("empty lock expression")]
    Empty,

    #[error("`{segment}` is not an identifier")]
    BadSegment { segment: String },

    #[error("unknown identifier `{name}`, not bound in `{scope}`{hint}")]
    UnknownBase { name: String, scope: String, hint: String },

    #[error("local `{name}` has no known type; annotate its `let` with one")]
    Untyped { name: String },

    #[error("type `{ty}` has no fields, cannot access `{field}`")]
    NotAStruct { ty: String, field: String },

    #[error("struct `{owner}` has no field `{field}`{hint}")]
    UnknownField { owner: String, field: String, hint: String },

    #[error("`{path}` is not a lock (type `{ty}`)")]
    NotALock { path: String, ty: String },
}

// ============================================================================
// Chain resolution
// ============================================================================

/// Split `a.b.c` into segments, rejecting anything that is not a plain path
pub fn split_lock_expr(expr: &str) -> Result<Vec<String>, ResolveError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(ResolveError::Empty);
    }
    expr.split('.')
        .map(|segment| {
            let mut chars = segment.chars();
            let valid = chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
            if valid {
                Ok(segment.to_string())
            } else {
                Err(ResolveError::BadSegment {
                    segment: segment.to_string(),
                })
            }
        })
        .collect()
}

/// Walk `fields` starting from a value of type `start`, returning the type
/// of the last field. Pointers are looked through and type arguments erased.
pub fn resolve_chain(layouts: &Layouts, start: &Type, fields: &[String]) -> Result<Type, ResolveError> {
    let mut ty = start.clone();
    for field in fields {
        let owner = ty.base_name();
        let Some(info) = layouts.get(owner) else {
            return Err(ResolveError::NotAStruct {
                ty: ty.to_string(),
                field: field.clone(),
            });
        };
        match info.field_type(field) {
            Some(next) => ty = next.clone(),
            None => {
                return Err(ResolveError::UnknownField {
                    owner: owner.to_string(),
                    field: field.clone(),
                    hint: did_you_mean(field, info.field_names()),
                });
            }
        }
    }
    Ok(ty)
}

/// Classify a resolved type as a lock
pub fn lock_kind(config: &Config, ty: &Type, path: &str) -> Result<LockKind, ResolveError> {
    config
        .lock_kind(ty.base_name())
        .ok_or_else(|| ResolveError::NotALock {
            path: path.to_string(),
            ty: ty.to_string(),
        })
}

/// Resolve a function contract's lock expression against the function's
/// receiver and parameters
pub fn resolve_signature_lock(
    layouts: &Layouts,
    config: &Config,
    def: &FnDef,
    expr: &str,
) -> Result<ContractLock, ResolveError> {
    let path = split_lock_expr(expr)?;
    let (base_name, fields) = path.split_first().ok_or(ResolveError::Empty)?;

    let (base, base_ty) = match &def.receiver {
        Some(recv) if recv.name.node == *base_name => (LockBase::Receiver, &recv.ty.node),
        _ => match def.params.iter().position(|p| p.name.node == *base_name) {
            Some(index) => (LockBase::Param(index), &def.params[index].ty.node),
            None => {
                let mut names: Vec<&str> = def.params.iter().map(|p| p.name.node.as_str()).collect();
                if let Some(recv) = &def.receiver {
                    names.push(recv.name.node.as_str());
                }
                return Err(ResolveError::UnknownBase {
                    name: base_name.clone(),
                    scope: def.qualified_name(),
                    hint: did_you_mean(base_name, names),
                });
            }
        },
    };

    let ty = resolve_chain(layouts, base_ty, fields)?;
    let kind = lock_kind(config, &ty, expr.trim())?;
    Ok(ContractLock {
        base,
        base_name: base_name.clone(),
        fields: fields.to_vec(),
        kind,
    })
}

// ============================================================================
// Lock arena
// ============================================================================

/// Index of a lock inside one function's [`LockTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(u32);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub path: String,
    pub kind: LockKind,
}

/// Per-function arena of canonical lock paths. Equal paths intern to the
/// same id; the table lives only as long as the function's analysis.
/// Entries keep the path as written, so a shadowed local's lock prints
/// under its source name.
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    entries: Vec<LockEntry>,
    index: HashMap<String, LockId>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, path: &[String], kind: LockKind) -> LockId {
        let key = path.join(".");
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = LockId(self.entries.len() as u32);
        self.entries.push(LockEntry {
            path: display_place(path),
            kind,
        });
        self.index.insert(key, id);
        id
    }

    pub fn lookup(&self, path: &str) -> Option<LockId> {
        self.index.get(path).copied()
    }

    pub fn get(&self, id: LockId) -> &LockEntry {
        &self.entries[id.0 as usize]
    }

    pub fn path(&self, id: LockId) -> &str {
        &self.get(id).path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
