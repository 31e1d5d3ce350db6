//! Source locations and compiler diagnostics for the Vireo compiler.
//!
//! Every error or warning the compiler reports is a [`Diagnostic`]: an
//! ordered list of parts, each with a severity, an optional source
//! location, and a message. A diagnostic usually opens with an `error`
//! part at the offending location and continues with `note` parts citing
//! related sites (a previous definition, a declaration, an excluded
//! group list).
//!
//! # Rendering
//!
//! Parts render one per line in the conventional style:
//! ```text
//! game.vr:10:5: error: global identifier `player` already in use
//! game.vr:3:1: note: previous definition here
//! ```

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// A source location: file path plus 1-indexed line and column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLoc {
    /// File path.
    pub file: PathBuf,
    /// 1-indexed line number.
    pub line: u32,
    /// 1-indexed column number (1 if unknown).
    pub column: u32,
}

impl SourceLoc {
    /// Creates a new source location.
    #[must_use]
    pub const fn new(file: PathBuf, line: u32, column: u32) -> Self {
        Self { file, line, column }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.column)
    }
}

/// Severity of a single diagnostic part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// A hard error; compilation cannot proceed past the current phase.
    Error,
    /// A non-fatal warning.
    Warning,
    /// Supplementary context attached to an error or warning.
    Note,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Note => write!(f, "note"),
        }
    }
}

/// One line of a diagnostic: severity, optional location, message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticPart {
    /// Severity of this part.
    pub severity: Severity,
    /// Source location, when one is known.
    pub loc: Option<SourceLoc>,
    /// Human-readable message.
    pub message: String,
}

impl DiagnosticPart {
    /// An `error` part at a location.
    #[must_use]
    pub fn error_at(loc: SourceLoc, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            loc: Some(loc),
            message: message.into(),
        }
    }

    /// An `error` part with no location.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            loc: None,
            message: message.into(),
        }
    }

    /// A `note` part at a location.
    #[must_use]
    pub fn note_at(loc: SourceLoc, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Note,
            loc: Some(loc),
            message: message.into(),
        }
    }

    /// A `note` part with no location.
    #[must_use]
    pub fn note(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Note,
            loc: None,
            message: message.into(),
        }
    }

    /// A `warning` part at a location.
    #[must_use]
    pub fn warning_at(loc: SourceLoc, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            loc: Some(loc),
            message: message.into(),
        }
    }
}

impl fmt::Display for DiagnosticPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.loc {
            Some(loc) => write!(f, "{loc}: {}: {}", self.severity, self.message),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

/// A complete diagnostic: one or more parts, primary part first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostic {
    parts: Vec<DiagnosticPart>,
}

impl Diagnostic {
    /// A single-part error diagnostic at a location.
    #[must_use]
    pub fn error_at(loc: SourceLoc, message: impl Into<String>) -> Self {
        Self {
            parts: vec![DiagnosticPart::error_at(loc, message)],
        }
    }

    /// A single-part error diagnostic with no location.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            parts: vec![DiagnosticPart::error(message)],
        }
    }

    /// A single-part warning diagnostic at a location.
    #[must_use]
    pub fn warning_at(loc: SourceLoc, message: impl Into<String>) -> Self {
        Self {
            parts: vec![DiagnosticPart::warning_at(loc, message)],
        }
    }

    /// Appends a located note part.
    #[must_use]
    pub fn with_note_at(mut self, loc: SourceLoc, message: impl Into<String>) -> Self {
        self.parts.push(DiagnosticPart::note_at(loc, message));
        self
    }

    /// Appends an unlocated note part.
    #[must_use]
    pub fn with_note(mut self, message: impl Into<String>) -> Self {
        self.parts.push(DiagnosticPart::note(message));
        self
    }

    /// Appends an arbitrary part.
    pub fn push(&mut self, part: DiagnosticPart) {
        self.parts.push(part);
    }

    /// All parts, primary first.
    #[must_use]
    pub fn parts(&self) -> &[DiagnosticPart] {
        &self.parts
    }

    /// The location of the primary part, when it has one.
    #[must_use]
    pub fn primary_loc(&self) -> Option<&SourceLoc> {
        self.parts.first().and_then(|part| part.loc.as_ref())
    }

    /// True when any part cites the given location.
    #[must_use]
    pub fn cites(&self, loc: &SourceLoc) -> bool {
        self.parts.iter().any(|part| part.loc.as_ref() == Some(loc))
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

/// A fatal compiler error carrying its diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{diagnostic}")]
pub struct CompilerError {
    /// The diagnostic to report.
    pub diagnostic: Diagnostic,
}

impl CompilerError {
    /// An error at a location.
    #[must_use]
    pub fn at(loc: SourceLoc, message: impl Into<String>) -> Self {
        Self {
            diagnostic: Diagnostic::error_at(loc, message),
        }
    }

    /// An error with no location.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            diagnostic: Diagnostic::error(message),
        }
    }

    /// Appends a located note part.
    #[must_use]
    pub fn with_note_at(mut self, loc: SourceLoc, message: impl Into<String>) -> Self {
        self.diagnostic = self.diagnostic.with_note_at(loc, message);
        self
    }

    /// Appends an unlocated note part.
    #[must_use]
    pub fn with_note(mut self, message: impl Into<String>) -> Self {
        self.diagnostic = self.diagnostic.with_note(message);
        self
    }
}

impl From<Diagnostic> for CompilerError {
    fn from(diagnostic: Diagnostic) -> Self {
        Self { diagnostic }
    }
}

/// Result alias defaulting the error type to [`CompilerError`].
pub type Result<T, E = CompilerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::{CompilerError, Diagnostic, DiagnosticPart, Severity, SourceLoc};
    use std::path::PathBuf;

    fn loc(line: u32, column: u32) -> SourceLoc {
        SourceLoc::new(PathBuf::from("game.vr"), line, column)
    }

    #[test]
    fn source_loc_renders_file_line_column() {
        assert_eq!(loc(10, 5).to_string(), "game.vr:10:5");
    }

    #[test]
    fn single_part_error_renders_on_one_line() {
        let err = CompilerError::at(loc(10, 5), "name not in scope");
        assert_eq!(err.to_string(), "game.vr:10:5: error: name not in scope");
    }

    #[test]
    fn notes_render_after_the_primary_part() {
        let err = CompilerError::at(loc(10, 5), "already in use")
            .with_note_at(loc(3, 1), "previous definition here");
        assert_eq!(
            err.to_string(),
            "game.vr:10:5: error: already in use\ngame.vr:3:1: note: previous definition here"
        );
    }

    #[test]
    fn unlocated_parts_omit_the_location_prefix() {
        let err = CompilerError::msg("program has no entry point");
        assert_eq!(err.to_string(), "error: program has no entry point");
    }

    #[test]
    fn primary_loc_is_the_first_part_location() {
        let err = CompilerError::at(loc(10, 5), "a").with_note_at(loc(3, 1), "b");
        assert_eq!(err.diagnostic.primary_loc(), Some(&loc(10, 5)));
    }

    #[test]
    fn cites_matches_any_part_location() {
        let err = CompilerError::at(loc(10, 5), "a").with_note_at(loc(3, 1), "b");
        assert!(err.diagnostic.cites(&loc(3, 1)));
        assert!(!err.diagnostic.cites(&loc(4, 1)));
    }

    #[test]
    fn warning_part_renders_with_warning_severity() {
        let diag = Diagnostic::warning_at(loc(7, 2), "preserving has no effect");
        assert_eq!(
            diag.to_string(),
            "game.vr:7:2: warning: preserving has no effect"
        );
    }

    #[test]
    fn push_appends_arbitrary_parts() {
        let mut diag = Diagnostic::error("recursive definition");
        diag.push(DiagnosticPart::note_at(loc(1, 1), "mutually recursive with"));
        assert_eq!(diag.parts().len(), 2);
        assert_eq!(diag.parts()[1].severity, Severity::Note);
    }
}
