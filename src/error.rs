//! Error types shared across the pipeline.
//!
//! Every steady-state failure here is fatal: the engine latches the first
//! error, drains in-flight work, and reports the cause from `next_batch`.
//! There are no retries anywhere in the core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected configuration. Reported from `Engine::init` only.
    #[error("invalid config: {0}")]
    Config(String),

    /// Dataset file missing, unreadable, or size mismatch. Reported from
    /// `Engine::init` only.
    #[error("dataset i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Allocation failure or table overflow during steady state.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// A pipeline invariant was violated (unmapped id, degree mismatch, a
    /// task field assigned twice).
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Shutdown was requested while the operation was blocked.
    #[error("cancelled by shutdown")]
    Cancelled,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Error::Resource(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }

    /// Errors caused by shutdown are expected during teardown and must not
    /// be latched as the fatal cause.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Config(s) => Error::Config(s.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Resource(s) => Error::Resource(s.clone()),
            Error::Invariant(s) => Error::Invariant(s.clone()),
            Error::Cancelled => Error::Cancelled,
        }
    }
}
