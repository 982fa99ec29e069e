//! Expression and statement AST nodes

use super::{Directive, Spanned, Type};
use serde::{Deserialize, Serialize};

/// Expression
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    /// Integer literal
    IntLit(i64),
    /// String literal
    StringLit(String),
    /// Boolean literal
    BoolLit(bool),
    /// `nil`
    Nil,

    /// Variable reference
    Var(String),

    /// Field access: expr.field
    Field {
        expr: Box<Spanned<Expr>>,
        field: Spanned<String>,
    },

    /// Call: callee(args). Method calls have a `Field` callee.
    Call {
        callee: Box<Spanned<Expr>>,
        args: Vec<Spanned<Expr>>,
    },

    /// Address-of: &expr
    AddrOf(Box<Spanned<Expr>>),

    /// Binary operation
    Binary {
        left: Box<Spanned<Expr>>,
        op: BinOp,
        right: Box<Spanned<Expr>>,
    },

    /// Unary operation
    Unary {
        op: UnOp,
        expr: Box<Spanned<Expr>>,
    },

    /// Struct literal: Name { field: value, ... }
    StructLit {
        name: String,
        fields: Vec<(Spanned<String>, Spanned<Expr>)>,
    },
}

impl Expr {
    /// Dotted path of a place expression (`pr.mu` → `["pr", "mu"]`),
    /// or `None` when the expression is not a variable/field chain
    pub fn as_path(&self) -> Option<Vec<String>> {
        match self {
            Expr::Var(name) => Some(vec![name.clone()]),
            Expr::Field { expr, field } => {
                let mut path = expr.node.as_path()?;
                path.push(field.node.clone());
                Some(path)
            }
            _ => None,
        }
    }
}

/// Statement with the directives written immediately before it (or
/// trailing on its last line)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stmt {
    pub directives: Vec<Spanned<Directive>>,
    pub kind: StmtKind,
    pub span: super::Span,
}

/// Statement kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StmtKind {
    /// let name (: ty)? = value;
    Let {
        name: Spanned<String>,
        ty: Option<Spanned<Type>>,
        value: Spanned<Expr>,
    },
    /// place = value;
    Assign {
        target: Spanned<Expr>,
        value: Spanned<Expr>,
    },
    /// expr;
    Expr(Spanned<Expr>),
    /// if cond { .. } else { .. }
    If {
        cond: Spanned<Expr>,
        then_block: Block,
        else_block: Option<Block>,
    },
    /// while cond { .. }
    While { cond: Spanned<Expr>, body: Block },
    /// loop { .. }
    Loop { body: Block },
    Break,
    Continue,
    /// return value?;
    Return(Option<Spanned<Expr>>),
    /// defer call;
    Defer(Spanned<Expr>),
}

/// A braced statement list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: super::Span,
}

/// Binary operator. Operands are walked for accesses; the operator itself
/// never matters to the lock analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}
