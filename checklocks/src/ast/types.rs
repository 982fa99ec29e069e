//! Type AST nodes

use serde::{Deserialize, Serialize};

/// Type representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    /// Named type, possibly package-qualified (`sync.Mutex`) and
    /// instantiated with type arguments (`Resource[T]`)
    Named { name: String, args: Vec<Type> },
    /// Pointer type `*T`
    Ptr(Box<Type>),
}

impl Type {
    pub fn named(name: impl Into<String>) -> Self {
        Type::Named {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Name of the underlying named type, looking through pointers and
    /// erasing type arguments
    pub fn base_name(&self) -> &str {
        match self {
            Type::Named { name, .. } => name,
            Type::Ptr(inner) => inner.base_name(),
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Named { name, args } if args.is_empty() => write!(f, "{name}"),
            Type::Named { name, args } => {
                write!(f, "{name}[")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, "]")
            }
            Type::Ptr(inner) => write!(f, "*{inner}"),
        }
    }
}
