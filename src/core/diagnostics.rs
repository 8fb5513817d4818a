// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Diagnostic types shared by the assembler and the linker.
//!
//! Recoverable problems become [`Diagnostic`] entries appended to a
//! [`Diagnostics`] collection so a run surfaces as many of them as possible.
//! Unrecoverable conditions (missing inputs, missing instruction table,
//! missing include) are [`FatalError`] values that abort the run with a
//! single message and never enter the collection.

use std::fmt;

use crate::report::{caret_line, highlight_line};

/// Categories of recoverable errors, with stable numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    UnknownMnemonic,
    OperandMismatch,
    UnresolvedSymbol,
    DuplicateExport,
    DuplicateSymbol,
    Overflow,
    CircularInclude,
    Io,
    Format,
}

impl ErrorKind {
    pub fn code(self) -> u16 {
        match self {
            Self::Syntax => 1,
            Self::UnknownMnemonic => 2,
            Self::OperandMismatch => 3,
            Self::UnresolvedSymbol => 4,
            Self::DuplicateExport => 5,
            Self::DuplicateSymbol => 6,
            Self::Overflow => 7,
            Self::CircularInclude => 8,
            Self::Io => 9,
            Self::Format => 10,
        }
    }
}

/// Categories of warnings, with stable numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    ImplicitImport,
    ValueTruncated,
    UnusedSymbol,
}

impl WarningKind {
    pub fn code(self) -> u16 {
        match self {
            Self::ImplicitImport => 1,
            Self::ValueTruncated => 2,
            Self::UnusedSymbol => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Error(ErrorKind),
    Warning(WarningKind),
}

impl DiagnosticKind {
    pub fn code(self) -> u16 {
        match self {
            Self::Error(kind) => kind.code(),
            Self::Warning(kind) => kind.code(),
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::Error(_) => Severity::Error,
            Self::Warning(_) => Severity::Warning,
        }
    }
}

/// One recoverable problem, located in source where possible.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    kind: DiagnosticKind,
    file: String,
    line: u32,
    column: Option<usize>,
    source: Option<String>,
    message: String,
}

impl Diagnostic {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Error(kind),
            file: String::new(),
            line: 0,
            column: None,
            source: None,
            message: message.into(),
        }
    }

    pub fn warning(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Warning(kind),
            file: String::new(),
            line: 0,
            column: None,
            source: None,
            message: message.into(),
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = file.into();
        self.line = line;
        self
    }

    pub fn with_column(mut self, column: Option<usize>) -> Self {
        self.column = column;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> DiagnosticKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    pub fn code(&self) -> u16 {
        self.kind.code()
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> Option<usize> {
        self.column
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// One-line form: `file:line:col: error #N: message`.
    pub fn format(&self) -> String {
        let sev = match self.severity() {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        let col = self.column.unwrap_or(0);
        format!(
            "{}:{}:{}: {} #{}: {}",
            self.file,
            self.line,
            col,
            sev,
            self.code(),
            self.message
        )
    }

    /// Full form: the one-line header, the offending source line, and a
    /// caret under the implicated column (omitted when no column applies).
    pub fn format_with_context(&self, use_color: bool) -> String {
        let mut out = self.format();
        if let Some(source) = &self.source {
            out.push('\n');
            out.push_str(&highlight_line(source, self.column, use_color));
            if let Some(col) = self.column {
                out.push('\n');
                out.push_str(&caret_line(col));
            }
        }
        out
    }
}

/// Append-only diagnostic collection for one run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.items
            .iter()
            .filter(|d| d.severity() == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.items
            .iter()
            .filter(|d| d.severity() == Severity::Warning)
            .count()
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// An unrecoverable condition. Aborts the whole run with a single message.
#[derive(Debug)]
pub struct FatalError {
    kind: ErrorKind,
    message: String,
}

impl FatalError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FatalError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ErrorKind::Syntax.code(), 1);
        assert_eq!(ErrorKind::UnresolvedSymbol.code(), 4);
        assert_eq!(ErrorKind::Format.code(), 10);
        assert_eq!(WarningKind::ValueTruncated.code(), 2);
    }

    #[test]
    fn format_includes_location_code_and_message() {
        let diag = Diagnostic::error(ErrorKind::UnknownMnemonic, "Unknown mnemonic: xyzzy")
            .with_location("boot.asm", 7)
            .with_column(Some(2));
        assert_eq!(
            diag.format(),
            "boot.asm:7:2: error #2: Unknown mnemonic: xyzzy"
        );
    }

    #[test]
    fn format_with_context_renders_caret_under_column() {
        let diag = Diagnostic::error(ErrorKind::Syntax, "Expected expression")
            .with_location("boot.asm", 3)
            .with_column(Some(8))
            .with_source("\tld a, +");
        let rendered = diag.format_with_context(false);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], ".......^");
    }

    #[test]
    fn format_with_context_omits_caret_without_column() {
        let diag = Diagnostic::error(ErrorKind::DuplicateExport, "Duplicate export: foo")
            .with_location("a.o", 0)
            .with_source("whole-line problem");
        let rendered = diag.format_with_context(false);
        assert_eq!(rendered.lines().count(), 2);
    }

    #[test]
    fn counts_split_by_severity() {
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::error(ErrorKind::Syntax, "a"));
        diags.push(Diagnostic::warning(WarningKind::ImplicitImport, "b"));
        diags.push(Diagnostic::error(ErrorKind::Overflow, "c"));
        assert_eq!(diags.error_count(), 2);
        assert_eq!(diags.warning_count(), 1);
    }
}
