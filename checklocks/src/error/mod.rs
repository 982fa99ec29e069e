//! Error types and reporting
//!
//! `CheckError` covers failures that stop a compilation unit from being
//! analyzed at all (unreadable file, bad syntax, bad configuration).
//! Contract violations are not errors; they are collected as
//! [`Diagnostic`](crate::diagnostics::Diagnostic)s.

use crate::ast::Span;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, CheckError>;

/// Operational error
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("Lexer error at {span:?}: {message}")]
    Lexer { message: String, span: Span },

    #[error("Parser error at {span:?}: {message}")]
    Parser { message: String, span: Span },

    #[error("IO error: {message}")]
    Io { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl CheckError {
    pub fn lexer(message: impl Into<String>, span: Span) -> Self {
        Self::Lexer {
            message: message.into(),
            span,
        }
    }

    pub fn parser(message: impl Into<String>, span: Span) -> Self {
        Self::Parser {
            message: message.into(),
            span,
        }
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            Self::Lexer { span, .. } => Some(*span),
            Self::Parser { span, .. } => Some(*span),
            Self::Io { .. } | Self::Config { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Lexer { message, .. } => message,
            Self::Parser { message, .. } => message,
            Self::Io { message } => message,
            Self::Config { message } => message,
        }
    }
}

impl From<std::io::Error> for CheckError {
    fn from(err: std::io::Error) -> Self {
        Self::io_error(err.to_string())
    }
}

/// Report error with ariadne
pub fn report_error(filename: &str, source: &str, error: &CheckError) {
    use ariadne::{Color, Label, Report, ReportKind, Source};

    let kind = match error {
        CheckError::Lexer { .. } => "Lexer",
        CheckError::Parser { .. } => "Parser",
        CheckError::Io { .. } => "IO",
        CheckError::Config { .. } => "Configuration",
    };

    let report = if let Some(span) = error.span() {
        Report::build(ReportKind::Error, (filename, span.start..span.end))
            .with_message(format!("{kind} error"))
            .with_label(
                Label::new((filename, span.start..span.end))
                    .with_message(error.message())
                    .with_color(Color::Red),
            )
            .finish()
    } else {
        Report::build(ReportKind::Error, (filename, 0..0))
            .with_message(format!("{kind} error: {}", error.message()))
            .finish()
    };

    // A failed write to stderr leaves nothing else to report to
    let _ = report.eprint((filename, Source::from(source)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_error_has_span() {
        let err = CheckError::parser("expected `;`", Span::new(4, 5));
        assert_eq!(err.span(), Some(Span::new(4, 5)));
        assert_eq!(err.message(), "expected `;`");
    }

    #[test]
    fn test_config_error_has_no_span() {
        let err = CheckError::config_error("unknown field `lokcs`");
        assert!(err.span().is_none());
        assert!(err.to_string().starts_with("Configuration error"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.ck");
        let err: CheckError = io.into();
        assert!(matches!(err, CheckError::Io { .. }));
        assert!(err.message().contains("missing.ck"));
    }
}
