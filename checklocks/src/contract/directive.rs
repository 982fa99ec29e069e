//! Annotation directive syntax
//!
//! Turns the raw text of a `// +...` comment into a [`DirectiveKind`].
//! Comments that do not belong to this analyzer (`+build`, `+gen`, ...)
//! are not directives at all; misspelled or malformed checklocks
//! directives are errors.

/// A recognized annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveKind {
    /// `+checklocks:<expr>`: guarded field, or exclusive precondition
    Guard(String),
    /// `+checklocksread:<expr>`: shared precondition
    Read(String),
    /// `+checkatomic`
    Atomic,
    /// `+checklocksacquire:<expr>`
    Acquire(String),
    /// `+checklocksrelease:<expr>`
    Release(String),
    /// `+checklocksignore`
    Ignore,
    /// `+checklocksforce:<expr>`
    Force(String),
    /// `+checklocksfail` / `+checklocksfail:<count>`
    Fail(Option<usize>),
}

impl DirectiveKind {
    /// Directive spelling, for messages
    pub fn name(&self) -> &'static str {
        match self {
            DirectiveKind::Guard(_) => "+checklocks",
            DirectiveKind::Read(_) => "+checklocksread",
            DirectiveKind::Atomic => "+checkatomic",
            DirectiveKind::Acquire(_) => "+checklocksacquire",
            DirectiveKind::Release(_) => "+checklocksrelease",
            DirectiveKind::Ignore => "+checklocksignore",
            DirectiveKind::Force(_) => "+checklocksforce",
            DirectiveKind::Fail(_) => "+checklocksfail",
        }
    }
}

/// Parse directive text (without the leading `+`).
///
/// Returns `None` for comments that are not checklocks directives.
pub fn parse_directive(text: &str) -> Option<Result<DirectiveKind, String>> {
    let text = text.trim();
    // The name ends at `:` (argument follows) or at whitespace (prose follows)
    let name_end = text
        .find(|c: char| c == ':' || c.is_whitespace())
        .unwrap_or(text.len());
    let name = &text[..name_end];
    let arg = text[name_end..].strip_prefix(':').map(str::trim);

    if !name.starts_with("checklocks") && !name.starts_with("checkatomic") {
        return None;
    }

    let with_expr = |make: fn(String) -> DirectiveKind| match arg {
        Some(expr) if !expr.is_empty() => Ok(make(expr.to_string())),
        _ => Err(format!("`+{name}` requires a lock expression, as in `+{name}:mu`")),
    };
    let bare = |kind: DirectiveKind| match arg {
        None => Ok(kind),
        Some(_) => Err(format!("`+{name}` takes no argument")),
    };

    let parsed = match name {
        "checklocks" => with_expr(DirectiveKind::Guard),
        "checklocksread" => with_expr(DirectiveKind::Read),
        "checklocksacquire" => with_expr(DirectiveKind::Acquire),
        "checklocksrelease" => with_expr(DirectiveKind::Release),
        "checklocksforce" => with_expr(DirectiveKind::Force),
        "checkatomic" => bare(DirectiveKind::Atomic),
        "checklocksignore" => bare(DirectiveKind::Ignore),
        "checklocksfail" => match arg {
            None => Ok(DirectiveKind::Fail(None)),
            Some(count) => count
                .parse::<usize>()
                .ok()
                .filter(|&n| n > 0)
                .map(|n| DirectiveKind::Fail(Some(n)))
                .ok_or_else(|| format!("`+checklocksfail` count must be a positive integer, found `{count}`")),
        },
        other => Err(format!("unknown directive `+{other}`")),
    };
    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(text: &str) -> DirectiveKind {
        parse_directive(text).expect("directive").expect("valid directive")
    }

    fn err(text: &str) -> String {
        parse_directive(text).expect("directive").unwrap_err()
    }

    #[test]
    fn test_guard_and_read() {
        assert_eq!(ok("checklocks:mu"), DirectiveKind::Guard("mu".into()));
        assert_eq!(ok("checklocks:pr.mu"), DirectiveKind::Guard("pr.mu".into()));
        assert_eq!(ok("checklocksread:gr.rwMu"), DirectiveKind::Read("gr.rwMu".into()));
    }

    #[test]
    fn test_space_after_colon_is_trimmed() {
        assert_eq!(ok("checklocksforce: pr.mu"), DirectiveKind::Force("pr.mu".into()));
    }

    #[test]
    fn test_bare_directives() {
        assert_eq!(ok("checkatomic"), DirectiveKind::Atomic);
        assert_eq!(ok("checklocksignore"), DirectiveKind::Ignore);
        assert_eq!(ok("checklocksfail"), DirectiveKind::Fail(None));
    }

    #[test]
    fn test_bare_directive_with_trailing_prose() {
        // `// +checklocksfail expected direct call violation` is a fail marker
        assert_eq!(
            ok("checklocksfail expected direct call violation"),
            DirectiveKind::Fail(None)
        );
    }

    #[test]
    fn test_fail_with_count() {
        assert_eq!(ok("checklocksfail:2"), DirectiveKind::Fail(Some(2)));
        assert!(err("checklocksfail:0").contains("positive integer"));
        assert!(err("checklocksfail:two").contains("positive integer"));
    }

    #[test]
    fn test_acquire_release() {
        assert_eq!(ok("checklocksacquire:pr.acquireReleaseMu"), DirectiveKind::Acquire("pr.acquireReleaseMu".into()));
        assert_eq!(ok("checklocksrelease:pr.acquireReleaseMu"), DirectiveKind::Release("pr.acquireReleaseMu".into()));
    }

    #[test]
    fn test_missing_expression() {
        assert!(err("checklocks").contains("requires a lock expression"));
        assert!(err("checklocksacquire:").contains("requires a lock expression"));
    }

    #[test]
    fn test_unexpected_argument() {
        assert!(err("checkatomic:mu").contains("takes no argument"));
    }

    #[test]
    fn test_unknown_checklocks_directive() {
        assert!(err("checklocksacquired:mu").contains("unknown directive"));
    }

    #[test]
    fn test_foreign_directives_are_ignored() {
        assert!(parse_directive("build linux").is_none());
        assert!(parse_directive("gen:stateify").is_none());
    }
}
