//! Report renderers: plain lines, ariadne reports, JSON

use serde::Serialize;

use crate::ast::LineIndex;

use super::{Diagnostic, HeldLock, Report, RuleKind, Severity};

impl Report {
    /// One line per diagnostic:
    /// `file:line:col: message (locks: held-set)`
    pub fn render_plain(&self, filename: &str, source: &str) -> String {
        let lines = LineIndex::new(source);
        let mut out = String::new();
        for d in &self.diagnostics {
            let (line, col) = lines.line_col(d.span.start);
            out.push_str(&format!(
                "{filename}:{line}:{col}: {} (locks: {})\n",
                d.message,
                d.held_description()
            ));
        }
        out
    }

    /// ariadne reports, one per diagnostic
    pub fn render_pretty(&self, filename: &str, source: &str) -> String {
        use ariadne::{Color, Config, Label, Report as AriadneReport, ReportKind, Source};

        let mut out = Vec::new();
        for d in &self.diagnostics {
            let color = match d.rule {
                RuleKind::ConfigurationError | RuleKind::UnmetExpectation => Color::Yellow,
                _ => Color::Red,
            };
            let report = AriadneReport::build(ReportKind::Error, (filename, d.span.start..d.span.end))
                .with_config(Config::default().with_color(false))
                .with_message(d.rule.to_string())
                .with_label(
                    Label::new((filename, d.span.start..d.span.end))
                        .with_message(&d.message)
                        .with_color(color),
                )
                .with_note(format!("locks: {}", d.held_description()))
                .finish();
            // Writing into a Vec cannot fail
            let _ = report.write((filename, Source::from(source)), &mut out);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// JSON array with resolved line/column positions
    pub fn render_json(&self, filename: &str, source: &str) -> serde_json::Result<String> {
        let lines = LineIndex::new(source);
        let entries: Vec<JsonDiagnostic<'_>> = self
            .diagnostics
            .iter()
            .map(|d| JsonDiagnostic::new(d, filename, &lines))
            .collect();
        serde_json::to_string_pretty(&entries)
    }
}

#[derive(Serialize)]
struct JsonDiagnostic<'a> {
    file: &'a str,
    line: usize,
    column: usize,
    severity: Severity,
    rule: RuleKind,
    message: &'a str,
    held: &'a [HeldLock],
}

impl<'a> JsonDiagnostic<'a> {
    fn new(d: &'a Diagnostic, file: &'a str, lines: &LineIndex) -> Self {
        let (line, column) = lines.line_col(d.span.start);
        Self {
            file,
            line,
            column,
            severity: d.severity,
            rule: d.rule,
            message: &d.message,
            held: &d.held,
        }
    }
}
