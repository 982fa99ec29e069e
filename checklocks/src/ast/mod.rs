//! Abstract Syntax Tree definitions

mod expr;
mod span;
mod types;

pub use expr::*;
pub use span::*;
pub use types::*;

use serde::{Deserialize, Serialize};

/// A compilation unit is a sequence of top-level items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub items: Vec<Item>,
}

impl Program {
    pub fn structs(&self) -> impl Iterator<Item = &StructDef> {
        self.items.iter().filter_map(|item| match item {
            Item::StructDef(s) => Some(s),
            Item::FnDef(_) => None,
        })
    }

    pub fn functions(&self) -> impl Iterator<Item = &FnDef> {
        self.items.iter().filter_map(|item| match item {
            Item::FnDef(f) => Some(f),
            Item::StructDef(_) => None,
        })
    }
}

/// Top-level item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Item {
    FnDef(FnDef),
    StructDef(StructDef),
}

/// Raw annotation comment, with the leading `//` and `+` stripped
/// (`// +checklocks:mu` → `checklocks:mu`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub text: String,
}

/// Struct definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructDef {
    pub directives: Vec<Spanned<Directive>>,
    pub name: Spanned<String>,
    pub type_params: Vec<Spanned<String>>,
    pub fields: Vec<StructField>,
    pub span: Span,
}

/// Struct field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructField {
    pub directives: Vec<Spanned<Directive>>,
    pub name: Spanned<String>,
    pub ty: Spanned<Type>,
}

/// Function definition, optionally a method with a receiver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FnDef {
    pub directives: Vec<Spanned<Directive>>,
    pub receiver: Option<Param>,
    pub name: Spanned<String>,
    pub type_params: Vec<Spanned<String>>,
    pub params: Vec<Param>,
    pub ret_ty: Option<Spanned<Type>>,
    pub body: Block,
    pub span: Span,
}

impl FnDef {
    /// Qualified display name: `Type.method` for methods, `name` otherwise
    pub fn qualified_name(&self) -> String {
        match &self.receiver {
            Some(recv) => format!("{}.{}", recv.ty.node.base_name(), self.name.node),
            None => self.name.node.clone(),
        }
    }
}

/// Function parameter (also used for receivers)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: Spanned<String>,
    pub ty: Spanned<Type>,
}
