//! Error types for docbench
//!
//! Errors fall into two groups. Session errors (unknown project, missing
//! executables, conflicting instrumentation, a missing temp root) abort the
//! whole benchmark session. Everything else concerns a single configuration
//! and only causes that run to be skipped; see [`Error::is_fatal`].

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for docbench operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a benchmark session
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV export or import error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Template rendering error
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Directory walk error
    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// Project name is neither a registered preset nor an existing path
    #[error("Project {0} not found")]
    UnknownProject(String),

    /// Required executable could not be located
    #[error("Could not find \"{name}\": {reason}")]
    MissingExecutable { name: String, reason: String },

    /// More than one instrumentation adapter was requested
    #[error("{0} can not be profiled together, because they influence each other too much. Use only one per call")]
    ConflictingInstrumentation(String),

    /// Temp root given by the caller does not exist
    #[error("Given temp folder does not exist: {0}")]
    TempRootMissing(PathBuf),

    /// Malformed command line overrides or session settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Project descriptor could not be read or is malformed
    #[error("Invalid project descriptor at {path}: {reason}")]
    InvalidDescriptor { path: PathBuf, reason: String },

    /// A template file of the preset bundle is missing
    #[error("Template not found: {0}")]
    TemplateNotFound(PathBuf),

    /// Info metric expression could not be parsed or evaluated
    #[error("Expression error in '{expression}': {reason}")]
    Expression { expression: String, reason: String },

    /// Project tree could not be generated
    #[error("Generation error: {0}")]
    Generation(String),

    /// Build execution error
    #[error("Build error: {0}")]
    Build(String),

    /// Profiling error
    #[error("Profiling error: {0}")]
    Profiling(String),
}

impl Error {
    /// Whether this error must abort the whole session.
    ///
    /// Fatal errors are structural: continuing would produce meaningless
    /// comparisons. All other errors only skip the affected configuration.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnknownProject(_)
                | Error::MissingExecutable { .. }
                | Error::ConflictingInstrumentation(_)
                | Error::TempRootMissing(_)
                | Error::Config(_)
        )
    }

    pub(crate) fn expression(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Expression {
            expression: expression.into(),
            reason: reason.into(),
        }
    }
}
