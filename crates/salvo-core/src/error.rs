//! Error types for salvo-core

use thiserror::Error;

/// Core error type. Configuration and precondition failures get their own
/// variants so the runner can tell them apart from child-process crashes.
#[derive(Error, Debug)]
pub enum Error {
    /// The job control document is invalid or incomplete
    #[error("invalid job control: {0}")]
    Config(String),

    /// A source tree could not be resolved or manipulated
    #[error("source error: {0}")]
    Source(String),

    /// An artifact could not be built or pulled
    #[error("build error: {0}")]
    Build(String),

    /// A benchmark run failed or did not produce its success marker
    #[error("benchmark error: {0}")]
    Benchmark(String),

    /// A child process exited non-zero; carries enough to reproduce the call
    #[error("command `{command}` exited with status {status}: {output}")]
    ProcessFailure {
        command: String,
        status: i32,
        output: String,
    },

    /// A configured feature has no implementation yet
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// The job control document could not be parsed
    #[error("unable to parse job control document: {0}")]
    Parse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that invalidate the whole run rather than one point.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Parse(_) | Error::NotImplemented(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
