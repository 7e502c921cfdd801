//! Compile error types shared by every pipeline stage.
//!
//! Each stage reports errors through the same [`CompileError`] enum so the
//! driver can print them uniformly as `file:row:col: [ERROR]: message` and
//! exit. Internal invariant violations use [`CompileError::Internal`],
//! which renders with an internal-error label to distinguish compiler bugs
//! from user mistakes.

use std::fmt;

/// Position of a token in the original source: file name plus 1-indexed
/// row and column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub row: usize,
    pub col: usize,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, row: usize, col: usize) -> Self {
        SourceLocation {
            file: file.into(),
            row,
            col,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.row, self.col)
    }
}

/// An error from one of the four pipeline stages, or an internal
/// compiler invariant violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    Scan {
        message: String,
        location: SourceLocation,
    },
    Preprocess {
        message: String,
        location: SourceLocation,
    },
    Parse {
        message: String,
        location: SourceLocation,
    },
    Generate {
        message: String,
        location: SourceLocation,
    },
    /// A compiler bug, not a user error.
    Internal {
        message: String,
        location: SourceLocation,
    },
}

impl CompileError {
    pub fn scan(message: impl Into<String>, location: SourceLocation) -> Self {
        CompileError::Scan {
            message: message.into(),
            location,
        }
    }

    pub fn preprocess(message: impl Into<String>, location: SourceLocation) -> Self {
        CompileError::Preprocess {
            message: message.into(),
            location,
        }
    }

    pub fn parse(message: impl Into<String>, location: SourceLocation) -> Self {
        CompileError::Parse {
            message: message.into(),
            location,
        }
    }

    pub fn generate(message: impl Into<String>, location: SourceLocation) -> Self {
        CompileError::Generate {
            message: message.into(),
            location,
        }
    }

    pub fn internal(message: impl Into<String>, location: SourceLocation) -> Self {
        CompileError::Internal {
            message: message.into(),
            location,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            CompileError::Scan { message, .. }
            | CompileError::Preprocess { message, .. }
            | CompileError::Parse { message, .. }
            | CompileError::Generate { message, .. }
            | CompileError::Internal { message, .. } => message,
        }
    }

    pub fn location(&self) -> &SourceLocation {
        match self {
            CompileError::Scan { location, .. }
            | CompileError::Preprocess { location, .. }
            | CompileError::Parse { location, .. }
            | CompileError::Generate { location, .. }
            | CompileError::Internal { location, .. } => location,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Internal { message, location } => {
                write!(f, "{}: [INTERNAL ERROR]: {}", location, message)
            }
            _ => write!(f, "{}: [ERROR]: {}", self.location(), self.message()),
        }
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_formatting() {
        let err = CompileError::parse("Expected expression", SourceLocation::new("main.hz", 3, 14));
        assert_eq!(err.to_string(), "main.hz:3:14: [ERROR]: Expected expression");
    }

    #[test]
    fn test_internal_error_label() {
        let err = CompileError::internal("no type for node", SourceLocation::new("a.hz", 1, 1));
        assert!(err.to_string().contains("[INTERNAL ERROR]"));
    }
}
