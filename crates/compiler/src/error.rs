//! Compilation error type shared by the lexer, the parser and the
//! semantic checks.

use crate::lexer::Position;

/// A diagnostic produced while compiling a source file.
///
/// Every compile error carries the source position it was detected at,
/// a human-readable message and an optional one-line suggestion. The
/// `Display` rendering matches what the CLI prints after the source
/// path prefix:
///
/// ```text
/// (3,7):
///         Expected token of type `semicolon`, got `id` (`y`).
///         -> Maybe a ";" or a "," is missing.
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub pos: Position,
    pub message: String,
    pub suggestion: Option<String>,
}

impl CompileError {
    pub fn new(pos: Position, message: impl Into<String>) -> Self {
        CompileError {
            pos,
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(
        pos: Position,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        CompileError {
            pos,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{}):\n\t{}", self.pos.row, self.pos.col, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n\t-> {}", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}
