//! checklocks
//!
//! Static checker for lock and atomic access contracts declared with
//! `// +checklocks...` annotations.

pub mod analysis;
pub mod ast;
pub mod config;
pub mod contract;
pub mod diagnostics;
pub mod error;
pub mod lexer;
pub mod mir;
pub mod parser;
pub mod resolve;
pub mod util;

pub use ast::Span;
pub use config::Config;
pub use diagnostics::{Diagnostic, Report, RuleKind};
pub use error::{CheckError, Result};

use tracing::debug;

/// Run the whole pipeline on one compilation unit
pub fn check_source(filename: &str, source: &str, config: &Config) -> Result<Report> {
    let tokens = lexer::tokenize(source)?;
    let program = parser::parse(filename, source, tokens)?;

    let (registry, config_errors) = contract::Registry::build(&program, config);
    let findings = analysis::analyze_program(&program, &registry, config);

    let mut reporter = diagnostics::Reporter::new();
    reporter.extend(config_errors);
    reporter.extend(findings);
    reporter.expect(diagnostics::collect_expectations(&program));
    let report = reporter.finish();

    debug!(file = filename, diagnostics = report.len(), "checked");
    Ok(report)
}
