//! Middle Intermediate Representation (MIR)
//!
//! MIR is a CFG-based intermediate representation between the AST and the
//! lock-state analysis. It makes control flow explicit through basic blocks
//! and terminators, and reduces statements to the few events the analysis
//! cares about: bindings, field accesses, calls and force overrides.
//!
//! Lowering is syntactic. Types, contracts and lock identities are attached
//! afterwards by [`crate::resolve`].

mod lower;

pub use lower::lower_function;

use std::fmt;

use serde::Serialize;

use crate::ast::{Span, Type};
use crate::contract::FnKey;

/// Separates a shadowing local's source name from its rename (`pr#1`)
pub const SHADOW_MARK: char = '#';

/// Name as written in the source, without any shadowing rename
pub fn source_name(name: &str) -> &str {
    name.split_once(SHADOW_MARK).map_or(name, |(base, _)| base)
}

/// Dotted place path as written in the source
pub fn display_place(path: &[String]) -> String {
    match path.split_first() {
        Some((base, rest)) => std::iter::once(source_name(base))
            .chain(rest.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join("."),
        None => String::new(),
    }
}

/// Direction of a field access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AccessKind {
    Read,
    Write,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessKind::Read => write!(f, "read"),
            AccessKind::Write => write!(f, "write"),
        }
    }
}

/// Index of a basic block within its function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// A MIR function with explicit control flow
#[derive(Debug, Clone)]
pub struct MirFunction {
    pub key: FnKey,
    pub receiver: Option<(String, Type)>,
    pub params: Vec<(String, Type)>,
    /// Basic blocks (first block is entry)
    pub blocks: Vec<BasicBlock>,
    pub span: Span,
}

/// A basic block: straight-line instructions and one terminator
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub instructions: Vec<MirInst>,
    pub terminator: Terminator,
}

/// How a `let` binding was initialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindInit {
    /// `let x = a.b;`
    Place(Vec<String>),
    /// `let x = &a.b;`
    Ref(Vec<String>),
    /// `let x = Name { .. };`
    Struct(String),
    /// `let x = f(..);` or `let x = a.f(..);`, typed by the callee's
    /// declared result
    Call(Callee),
    /// Anything else; only a declared type gives the binding a type
    Opaque,
}

/// Call target before resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    /// `a.b.name(..)`: a method on the place `a.b`, or a package function
    /// when `a` is not bound
    Method { receiver: Vec<String>, name: String },
    /// `name(..)`
    Function(String),
}

impl fmt::Display for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callee::Method { receiver, name } => write!(f, "{}.{name}", receiver.join(".")),
            Callee::Function(name) => write!(f, "{name}"),
        }
    }
}

/// MIR instruction (non-terminating)
#[derive(Debug, Clone, PartialEq)]
pub enum MirInst {
    /// Local binding
    Bind {
        name: String,
        ty: Option<Type>,
        init: BindInit,
    },
    /// Read or write of a place; `atomic` when performed through an
    /// atomic operation
    Access {
        place: Vec<String>,
        kind: AccessKind,
        atomic: bool,
        span: Span,
    },
    /// Call; each argument is kept as a place path when it is one
    /// (`&x` counts as `x`)
    Call {
        callee: Callee,
        args: Vec<Option<Vec<String>>>,
        span: Span,
    },
    /// `+checklocksforce:<lock>`; `base` is the MIR name of the lock
    /// expression's first segment when a shadowing `let` renamed it
    Force {
        lock: String,
        base: Option<String>,
        span: Span,
    },
}

/// Block terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    /// Return from function; `span` locates the `return` statement or the
    /// closing brace of the body
    Return { span: Span },
    /// Unconditional jump
    Goto(BlockId),
    /// Two-way branch on a condition the analysis does not evaluate
    Branch { then_block: BlockId, else_block: BlockId },
    /// Never reached
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Goto(target) => vec![*target],
            Terminator::Branch { then_block, else_block } => vec![*then_block, *else_block],
            Terminator::Return { .. } | Terminator::Unreachable => Vec::new(),
        }
    }
}

impl MirFunction {
    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0]
    }

    /// Blocks reachable from entry
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.blocks.len()];
        let mut stack = vec![self.entry()];
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id.0], true) {
                continue;
            }
            stack.extend(self.block(id).terminator.successors());
        }
        seen
    }

    /// Reachable blocks in reverse postorder: a block comes before its
    /// successors except along back edges
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut order = Vec::with_capacity(self.blocks.len());
        // (block, index of the next successor to visit)
        let mut stack = vec![(self.entry(), 0usize)];
        visited[self.entry().0] = true;

        while let Some((id, next)) = stack.pop() {
            let successors = self.block(id).terminator.successors();
            match successors.get(next) {
                Some(&succ) => {
                    stack.push((id, next + 1));
                    if !visited[succ.0] {
                        visited[succ.0] = true;
                        stack.push((succ, 0));
                    }
                }
                None => order.push(id),
            }
        }

        order.reverse();
        order
    }
}

// ============================================================================
// Text output
// ============================================================================

/// Format MIR as text
pub fn format_mir(functions: &[MirFunction]) -> String {
    functions
        .iter()
        .map(format_mir_function)
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_mir_function(func: &MirFunction) -> String {
    let mut out = String::new();
    let params: Vec<String> = func
        .receiver
        .iter()
        .chain(func.params.iter())
        .map(|(name, ty)| format!("{name}: {ty}"))
        .collect();
    out.push_str(&format!("fn {}({}) {{\n", func.key, params.join(", ")));

    for (i, block) in func.blocks.iter().enumerate() {
        out.push_str(&format!("  {}:\n", BlockId(i)));
        for inst in &block.instructions {
            out.push_str(&format!("    {}\n", format_inst(inst)));
        }
        out.push_str(&format!("    {}\n", format_terminator(&block.terminator)));
    }

    out.push_str("}\n");
    out
}

fn format_inst(inst: &MirInst) -> String {
    match inst {
        MirInst::Bind { name, ty, init } => {
            let ty = ty.as_ref().map(|t| format!(": {t}")).unwrap_or_default();
            let init = match init {
                BindInit::Place(path) => path.join("."),
                BindInit::Ref(path) => format!("&{}", path.join(".")),
                BindInit::Struct(name) => format!("{name} {{ .. }}"),
                BindInit::Call(callee) => format!("{callee}(..)"),
                BindInit::Opaque => "_".to_string(),
            };
            format!("let {name}{ty} = {init}")
        }
        MirInst::Access { place, kind, atomic, .. } => {
            let atomic = if *atomic { "atomic " } else { "" };
            format!("{atomic}{kind} {}", place.join("."))
        }
        MirInst::Call { callee, args, .. } => {
            let args: Vec<String> = args
                .iter()
                .map(|a| a.as_ref().map(|p| p.join(".")).unwrap_or_else(|| "_".to_string()))
                .collect();
            format!("call {callee}({})", args.join(", "))
        }
        MirInst::Force { lock, .. } => format!("force {lock}"),
    }
}

fn format_terminator(term: &Terminator) -> String {
    match term {
        Terminator::Return { .. } => "return".to_string(),
        Terminator::Goto(target) => format!("goto {target}"),
        Terminator::Branch { then_block, else_block } => format!("branch {then_block}, {else_block}"),
        Terminator::Unreachable => "unreachable".to_string(),
    }
}
