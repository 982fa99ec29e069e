//! Diagnostics and reporting
//!
//! Every finding of the analysis is a [`Diagnostic`] carrying the rule it
//! violates and a snapshot of the locks held where it was found. The
//! [`Reporter`] merges per-function diagnostic lists, reconciles them with
//! `+checklocksfail` expectations, and produces a deterministically ordered
//! [`Report`].

mod render;

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::ast::{Block, Program, Span, Stmt, StmtKind};
use crate::contract::{DirectiveKind, LockMode, parse_directive};

/// Diagnostic severity. Every rule is currently an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
}

/// Rule taxonomy, in reporting order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RuleKind {
    AccessViolation,
    AtomicAccessViolation,
    MixedModeViolation,
    CallPreconditionViolation,
    AcquireViolation,
    ReleaseViolation,
    ExitStateViolation,
    ConfigurationError,
    /// A `+checklocksfail` marker whose count was not met
    UnmetExpectation,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleKind::AccessViolation => "access violation",
            RuleKind::AtomicAccessViolation => "atomic access violation",
            RuleKind::MixedModeViolation => "mixed mode violation",
            RuleKind::CallPreconditionViolation => "call precondition violation",
            RuleKind::AcquireViolation => "acquire violation",
            RuleKind::ReleaseViolation => "release violation",
            RuleKind::ExitStateViolation => "exit state violation",
            RuleKind::ConfigurationError => "configuration error",
            RuleKind::UnmetExpectation => "unmet expectation",
        };
        write!(f, "{name}")
    }
}

/// One held lock in a diagnostic's snapshot
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct HeldLock {
    pub lock: String,
    pub mode: LockMode,
}

/// A single finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub span: Span,
    pub rule: RuleKind,
    pub message: String,
    /// Locks held at the point, sorted by path
    pub held: Vec<HeldLock>,
}

impl Diagnostic {
    pub fn new(rule: RuleKind, span: Span, message: impl Into<String>, mut held: Vec<HeldLock>) -> Self {
        held.sort();
        Self {
            severity: Severity::Error,
            span,
            rule,
            message: message.into(),
            held,
        }
    }

    pub fn configuration(span: Span, message: impl Into<String>) -> Self {
        Self::new(RuleKind::ConfigurationError, span, message, Vec::new())
    }

    /// `pr.mu (exclusive), pr.rwMu (shared)` or `no locks held`
    pub fn held_description(&self) -> String {
        if self.held.is_empty() {
            return "no locks held".to_string();
        }
        self.held
            .iter()
            .map(|h| format!("{} ({})", h.lock, h.mode))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ============================================================================
// Expectations
// ============================================================================

/// A `+checklocksfail` marker on a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
    pub span: Span,
    /// Exact count, or at least one when `None`
    pub count: Option<usize>,
}

impl Expectation {
    fn is_met(&self, found: usize) -> bool {
        match self.count {
            Some(n) => found == n,
            None => found > 0,
        }
    }
}

/// Collect the expectation markers of every statement in the program
pub fn collect_expectations(program: &Program) -> Vec<Expectation> {
    let mut out = Vec::new();
    for func in program.functions() {
        collect_block(&func.body, &mut out);
    }
    out
}

fn collect_block(block: &Block, out: &mut Vec<Expectation>) {
    for stmt in &block.stmts {
        collect_stmt(stmt, out);
    }
}

fn collect_stmt(stmt: &Stmt, out: &mut Vec<Expectation>) {
    for directive in &stmt.directives {
        if let Some(Ok(DirectiveKind::Fail(count))) = parse_directive(&directive.node.text) {
            out.push(Expectation { span: stmt.span, count });
        }
    }
    match &stmt.kind {
        StmtKind::If {
            then_block,
            else_block,
            ..
        } => {
            collect_block(then_block, out);
            if let Some(else_block) = else_block {
                collect_block(else_block, out);
            }
        }
        StmtKind::While { body, .. } | StmtKind::Loop { body } => collect_block(body, out),
        _ => {}
    }
}

// ============================================================================
// Reporter
// ============================================================================

/// Collects diagnostics from every stage, then orders and reconciles them
#[derive(Debug, Default)]
pub struct Reporter {
    diagnostics: Vec<Diagnostic>,
    expectations: Vec<Expectation>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        self.diagnostics.extend(diagnostics);
    }

    pub fn expect(&mut self, expectations: impl IntoIterator<Item = Expectation>) {
        self.expectations.extend(expectations);
    }

    /// Match diagnostics against expectations and sort the remainder.
    ///
    /// A diagnostic belongs to the innermost expectation whose statement
    /// contains it. A met expectation consumes its diagnostics; an unmet
    /// one keeps them and adds an `UnmetExpectation`.
    pub fn finish(self) -> Report {
        let Reporter {
            diagnostics,
            expectations,
        } = self;

        let owner: Vec<Option<usize>> = diagnostics
            .iter()
            .map(|d| {
                expectations
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.span.contains(d.span))
                    .min_by_key(|(_, e)| e.span.end - e.span.start)
                    .map(|(i, _)| i)
            })
            .collect();

        let mut found = vec![0usize; expectations.len()];
        for i in owner.iter().flatten() {
            found[*i] += 1;
        }
        let met: Vec<bool> = expectations
            .iter()
            .zip(&found)
            .map(|(e, &n)| e.is_met(n))
            .collect();

        let mut kept: Vec<Diagnostic> = diagnostics
            .into_iter()
            .zip(owner)
            .filter(|(_, owner)| !owner.is_some_and(|i| met[i]))
            .map(|(d, _)| d)
            .collect();
        let consumed = found.iter().zip(&met).filter(|(_, m)| **m).map(|(n, _)| n).sum::<usize>();

        for ((expectation, n), ok) in expectations.iter().zip(&found).zip(&met) {
            if *ok {
                continue;
            }
            let message = match expectation.count {
                Some(want) => format!("expected {want} diagnostic(s) at this statement, found {n}"),
                None => "expected a diagnostic at this statement, found none".to_string(),
            };
            kept.push(Diagnostic::new(RuleKind::UnmetExpectation, expectation.span, message, Vec::new()));
        }

        kept.sort_by(|a, b| {
            (a.span.start, a.rule, &a.message, a.span.end).cmp(&(b.span.start, b.rule, &b.message, b.span.end))
        });
        debug!(
            reported = kept.len(),
            expected = consumed,
            expectations = expectations.len(),
            "report finished"
        );
        Report { diagnostics: kept }
    }
}

/// Final ordered list of diagnostics for one compilation unit
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub diagnostics: Vec<Diagnostic>,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn count(&self, rule: RuleKind) -> usize {
        self.diagnostics.iter().filter(|d| d.rule == rule).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse;

    fn diag(rule: RuleKind, start: usize, end: usize) -> Diagnostic {
        Diagnostic::new(rule, Span::new(start, end), format!("{rule}"), Vec::new())
    }

    #[test]
    fn test_held_description() {
        let d = Diagnostic::new(
            RuleKind::AccessViolation,
            Span::new(0, 1),
            "m",
            vec![
                HeldLock {
                    lock: "pr.rwMu".into(),
                    mode: LockMode::HeldShared,
                },
                HeldLock {
                    lock: "pr.mu".into(),
                    mode: LockMode::HeldExclusive,
                },
            ],
        );
        assert_eq!(d.held_description(), "pr.mu (exclusive), pr.rwMu (shared)");
        assert_eq!(diag(RuleKind::AccessViolation, 0, 1).held_description(), "no locks held");
    }

    #[test]
    fn test_ordering_is_offset_then_rule() {
        let mut reporter = Reporter::new();
        reporter.extend(vec![
            diag(RuleKind::ExitStateViolation, 50, 51),
            diag(RuleKind::AtomicAccessViolation, 10, 12),
            diag(RuleKind::MixedModeViolation, 10, 12),
            diag(RuleKind::AccessViolation, 10, 12),
        ]);
        let report = reporter.finish();
        let rules: Vec<RuleKind> = report.diagnostics.iter().map(|d| d.rule).collect();
        assert_eq!(
            rules,
            vec![
                RuleKind::AccessViolation,
                RuleKind::AtomicAccessViolation,
                RuleKind::MixedModeViolation,
                RuleKind::ExitStateViolation,
            ]
        );
    }

    #[test]
    fn test_met_expectation_consumes() {
        let mut reporter = Reporter::new();
        reporter.extend(vec![diag(RuleKind::AccessViolation, 12, 20)]);
        reporter.expect(vec![Expectation {
            span: Span::new(10, 22),
            count: None,
        }]);
        assert!(reporter.finish().is_clean());
    }

    #[test]
    fn test_unmet_expectation_reports() {
        let mut reporter = Reporter::new();
        reporter.expect(vec![Expectation {
            span: Span::new(10, 22),
            count: None,
        }]);
        let report = reporter.finish();
        assert_eq!(report.len(), 1);
        assert_eq!(report.diagnostics[0].rule, RuleKind::UnmetExpectation);
    }

    #[test]
    fn test_exact_count_mismatch_keeps_diagnostics() {
        let mut reporter = Reporter::new();
        reporter.extend(vec![diag(RuleKind::MixedModeViolation, 12, 20)]);
        reporter.expect(vec![Expectation {
            span: Span::new(10, 22),
            count: Some(2),
        }]);
        let report = reporter.finish();
        assert_eq!(report.len(), 2);
        assert_eq!(report.count(RuleKind::MixedModeViolation), 1);
        assert_eq!(report.count(RuleKind::UnmetExpectation), 1);
        // The expectation starts first, so its diagnostic sorts first
        let unmet = &report.diagnostics[0];
        assert_eq!(unmet.rule, RuleKind::UnmetExpectation);
        assert!(unmet.message.contains("expected 2"), "{}", unmet.message);
        assert_eq!(report.diagnostics[1].rule, RuleKind::MixedModeViolation);
    }

    #[test]
    fn test_innermost_expectation_wins() {
        let mut reporter = Reporter::new();
        reporter.extend(vec![diag(RuleKind::AccessViolation, 30, 35)]);
        reporter.expect(vec![
            Expectation {
                span: Span::new(0, 100),
                count: None,
            },
            Expectation {
                span: Span::new(28, 40),
                count: Some(1),
            },
        ]);
        let report = reporter.finish();
        // The outer marker sees nothing once the inner one claims the finding
        assert_eq!(report.len(), 1);
        assert_eq!(report.diagnostics[0].span, Span::new(0, 100));
    }

    #[test]
    fn test_collect_expectations_from_nested_blocks() {
        let source = "fn f(c: bool, pr: *R) {
            // +checklocksfail
            pr.a = 1;
            if c {
                pr.b = 2; // +checklocksfail:2
            }
        }";
        let program = parse("test.ck", source, tokenize(source).unwrap()).unwrap();
        let expectations = collect_expectations(&program);
        assert_eq!(expectations.len(), 2);
        assert_eq!(expectations[0].count, None);
        assert_eq!(expectations[1].count, Some(2));
    }
}
