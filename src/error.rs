//! Error types for screenshot rendering

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for rendering operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while rendering or cleaning up screenshots
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration (unresolvable browser, bad viewport, zero attempts)
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Failed to launch a rendering session
    #[error("Browser launch failed: {0}")]
    InitializationError(String),

    /// Failed to load the HTML content or wait for network idle
    #[error("Failed to load content: {0}")]
    LoadError(String),

    /// Failed to open, capture or close a page
    #[error("Rendering failed: {0}")]
    RenderError(String),

    /// The output directory could not be created
    #[error("Failed to prepare output directory {}: {source}", path.display())]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The screenshot could not be written
    #[error("Failed to write screenshot {}: {source}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A single attempt exceeded its deadline
    #[error("Attempt timed out after {0}ms")]
    Timeout(u64),

    /// Every attempt failed; `last` is the error of the final attempt
    #[error("Failed after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    /// Deleting a screenshot failed
    #[error("Failed to delete {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when all retry attempts were used up.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::RetriesExhausted { .. })
    }

    /// The error of the final attempt, if this is an exhaustion error.
    pub fn last_attempt_error(&self) -> Option<&Error> {
        match self {
            Error::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    /// True when a cleanup failed because the file did not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Cleanup { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
