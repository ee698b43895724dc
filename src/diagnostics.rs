/// Diagnostic rendering — routes every compile-time failure through a
/// `miette::Diagnostic` so the embedder gets rustc-grade terminal output
/// (source context, byte-span underline, a one-line help message) instead
/// of a bare `Display` string.
use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use crate::errors::{CompileError, LexError, ParseError, Span};

fn span_to_source_span(span: Span) -> SourceSpan {
    (span.start, span.end.saturating_sub(span.start).max(1)).into()
}

/// A compile-time diagnostic ready for `miette::GraphicalReportHandler`.
#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
pub struct EngineDiagnostic {
    message: String,
    #[source_code]
    src: NamedSource<String>,
    #[label("{label}")]
    span: SourceSpan,
    label: String,
    #[help]
    help: Option<String>,
}

impl EngineDiagnostic {
    pub fn new(source_name: &str, source: &str, span: Span, message: impl Into<String>, label: impl Into<String>, help: Option<String>) -> Self {
        EngineDiagnostic {
            message: message.into(),
            src: NamedSource::new(source_name, source.to_string()),
            span: span_to_source_span(span),
            label: label.into(),
            help,
        }
    }

    pub fn from_lex_error(source_name: &str, source: &str, e: &LexError) -> Self {
        EngineDiagnostic::new(source_name, source, e.span(), e.to_string(), "here", None)
    }

    pub fn from_parse_error(source_name: &str, source: &str, e: &ParseError) -> Self {
        EngineDiagnostic::new(source_name, source, e.span(), e.to_string(), "unexpected here", None)
    }

    pub fn from_compile_error(source_name: &str, source: &str, e: &CompileError) -> Self {
        let help = match e {
            CompileError::AssignToConst { .. } => Some("declare the binding with `let` if it needs to be reassigned".to_string()),
            CompileError::BreakOutsideLoop { .. } | CompileError::ContinueOutsideLoop { .. } => {
                Some("this only makes sense inside `while`, `for`, or a labeled block".to_string())
            }
            CompileError::AwaitOutsideAsync { .. } => Some("mark the enclosing function `async`".to_string()),
            CompileError::YieldOutsideGenerator { .. } => Some("mark the enclosing function as a generator (`function*`)".to_string()),
            _ => None,
        };
        EngineDiagnostic::new(source_name, source, e.span(), e.to_string(), "here", help)
    }

    /// Render to a string using miette's graphical handler, for callers that
    /// don't want to go through `miette::Report` directly (e.g. tests).
    pub fn render(&self) -> String {
        let mut out = String::new();
        let handler = miette::GraphicalReportHandler::new();
        let _ = handler.render_report(&mut out, self);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_a_span_underline() {
        let span = Span::new(0, 4, 8);
        let diag = EngineDiagnostic::new("test.js", "let xxxx = ;", span, "unexpected token", "here", None);
        let rendered = diag.render();
        assert!(rendered.contains("unexpected token"));
    }
}
