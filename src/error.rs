//! Project-wide error types for logrok.
//!
//! This module defines a `thiserror`-based `Error` enum and a `Result<T>` alias
//! that are intended to be used across the crate.

use thiserror::Error;

/// Project-level error enum.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Glob pattern error: {0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Glob error: {0}")]
    Glob(#[from] glob::GlobError),

    #[error("Rustyline error: {0}")]
    Readline(#[from] rustyline::error::ReadlineError),

    // Domain-specific errors
    #[error("Format compile error: {0}")]
    Format(String),

    /// Query syntax error. The message carries the offending query and a
    /// caret line pointing at the bad token.
    #[error("{0}")]
    Syntax(String),

    /// The query tokenised cleanly but ended before the statement was
    /// complete. Carries the query text.
    #[error("unexpected end of query:\n{0}")]
    IncompleteQuery(String),

    /// Semantic query error: unknown field or function, arity mismatch,
    /// aggregation over a non-numeric column.
    #[error("Query error: {0}")]
    Query(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("interrupted")]
    Interrupted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No files found for path: {0}")]
    NoFiles(String),

    #[error("{0}")]
    Other(String),
}

/// Convenience result alias using the crate's `Error`.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Convenience constructor for `Other` variant.
    pub fn other<S: Into<String>>(s: S) -> Self {
        Error::Other(s.into())
    }

    /// True for errors the interactive shell recovers from by printing and
    /// returning to the prompt.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Syntax(_)
                | Error::IncompleteQuery(_)
                | Error::Query(_)
                | Error::Worker(_)
                | Error::Interrupted
        )
    }
}
