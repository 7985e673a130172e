//! Errors reported before a script gets to run.
//!
//! Runtime failures are not errors here: an uncaught exception or a timeout
//! is part of the captured output of a run.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// The language tag is outside the supported set; nothing was executed.
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// TypeScript or JSX source could not be translated.
    #[error("{0}")]
    Translation(String),

    /// Plain JavaScript failed to parse.
    #[error("SyntaxError: {message} ({line}:{column})")]
    Syntax {
        message: String,
        line: usize,
        column: usize,
    },

    /// The blocking worker running the script went away.
    #[error("Execution worker failed: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
