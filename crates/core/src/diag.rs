use std::fmt;

use ariadne::{Color, Label, ReportKind, Source};

use crate::span::{SourceMap, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    /// Compiler invariant violation. Always fatal.
    InternalError,
}

#[derive(Debug, Clone)]
pub struct LabelledSpan {
    pub span: Span,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub primary: Span,
    pub labels: Vec<LabelledSpan>,
    /// Extra lines grouped under this diagnostic (multi-line explanations,
    /// candidate listings, let backtraces).
    pub continued: Vec<String>,
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn error(primary: Span, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, primary, message)
    }

    pub fn warning(primary: Span, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, primary, message)
    }

    pub fn internal(primary: Span, message: impl Into<String>) -> Self {
        Self::new(Severity::InternalError, primary, message)
    }

    fn new(severity: Severity, primary: Span, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            primary,
            labels: Vec::new(),
            continued: Vec::new(),
            hint: None,
        }
    }

    pub fn with_label(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(LabelledSpan {
            span,
            message: message.into(),
        });
        self
    }

    pub fn with_continued(mut self, line: impl Into<String>) -> Self {
        self.continued.push(line.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Accumulating error sink shared by every compilation phase.
///
/// Non-fatal errors pile up so a single run reports as many problems as
/// possible; `validate()` is called at each phase boundary and returns whether
/// the phase may proceed. Fatal and internal errors stop the compile at the
/// next check regardless of count.
#[derive(Debug, Default)]
pub struct Report {
    diagnostics: Vec<Diagnostic>,
    errors_since_validate: usize,
    fatal: bool,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, diagnostic: Diagnostic) {
        debug_assert_eq!(diagnostic.severity, Severity::Error);
        self.errors_since_validate += 1;
        self.diagnostics.push(diagnostic);
    }

    pub fn warning(&mut self, diagnostic: Diagnostic) {
        debug_assert_eq!(diagnostic.severity, Severity::Warning);
        self.diagnostics.push(diagnostic);
    }

    /// Error that must stop the compile even before the phase boundary check.
    pub fn fatal(&mut self, diagnostic: Diagnostic) {
        self.errors_since_validate += 1;
        self.fatal = true;
        self.diagnostics.push(diagnostic);
    }

    /// Invariant violation inside the compiler itself.
    pub fn internal_error(&mut self, span: Span, message: impl Into<String>) {
        self.fatal = true;
        self.errors_since_validate += 1;
        self.diagnostics
            .push(Diagnostic::internal(span, format!("internal error: {}", message.into())));
    }

    /// Append a continuation line to the most recent diagnostic.
    pub fn continued(&mut self, line: impl Into<String>) {
        if let Some(last) = self.diagnostics.last_mut() {
            last.continued.push(line.into());
        }
    }

    /// True iff no error accumulated since the previous call and nothing
    /// fatal happened. Resets the accumulation counter.
    pub fn validate(&mut self) -> bool {
        let ok = self.errors_since_validate == 0 && !self.fatal;
        self.errors_since_validate = 0;
        ok
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|diagnostic| diagnostic.severity != Severity::Warning)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn render(&self, source_map: &SourceMap) -> String {
        render_diagnostics(source_map, &self.diagnostics)
    }
}

pub fn render_diagnostic(source_map: &SourceMap, diagnostic: &Diagnostic) -> String {
    let Some(file) = source_map.get(diagnostic.primary.source_id) else {
        return format!("error: {}", diagnostic.message);
    };

    let mut output = Vec::new();
    let kind = match diagnostic.severity {
        Severity::Error | Severity::InternalError => ReportKind::Error,
        Severity::Warning => ReportKind::Warning,
    };

    let mut message = diagnostic.message.clone();
    for line in &diagnostic.continued {
        message.push('\n');
        message.push_str(line);
    }

    let mut report = ariadne::Report::build(kind, file.name.clone(), diagnostic.primary.start)
        .with_message(message)
        .with_label(
            Label::new((file.name.clone(), diagnostic.primary.as_range()))
                .with_color(Color::Red)
                .with_message("here"),
        );

    for label in &diagnostic.labels {
        let label_file = source_map.must_get(label.span.source_id);
        report = report.with_label(
            Label::new((label_file.name.clone(), label.span.as_range()))
                .with_color(Color::Yellow)
                .with_message(label.message.clone()),
        );
    }

    if let Some(hint) = &diagnostic.hint {
        report = report.with_note(hint.clone());
    }

    let _ = report.finish().write(
        (file.name.clone(), Source::from(file.text.clone())),
        &mut output,
    );

    String::from_utf8_lossy(&output).into_owned()
}

pub fn render_diagnostics(source_map: &SourceMap, diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|diag| render_diagnostic(source_map, diag))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::SourceId;

    fn span() -> Span {
        Span::new(SourceId(0), 0, 1)
    }

    #[test]
    fn validate_resets_between_phases() {
        let mut report = Report::new();
        assert!(report.validate());

        report.error(Diagnostic::error(span(), "bad thing"));
        assert!(!report.validate());
        assert!(report.validate());
    }

    #[test]
    fn warnings_do_not_fail_validation() {
        let mut report = Report::new();
        report.warning(Diagnostic::warning(span(), "suspicious thing"));
        assert!(report.validate());
        assert!(!report.has_errors());
    }

    #[test]
    fn fatal_errors_stick() {
        let mut report = Report::new();
        report.internal_error(span(), "cursor drift");
        assert!(!report.validate());
        assert!(!report.validate());
        assert!(report.is_fatal());
    }
}
