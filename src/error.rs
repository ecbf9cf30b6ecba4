use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by the session manager core
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or unparseable configuration / stored state
    #[error("configuration error: {0}")]
    Config(String),
    /// The multiplexer binary cannot be found or executed
    #[error("multiplexer unavailable: {0}")]
    MultiplexerUnavailable(String),
    /// Non-zero exit from a multiplexer call, carrying stderr
    #[error("multiplexer error: {0}")]
    Multiplexer(String),
    #[error("session is not running")]
    NotRunning,
    #[error("session is already running")]
    AlreadyRunning,
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
    #[error("vcs error: {0}")]
    Vcs(String),
    #[error("{what} timed out after {}ms", after.as_millis())]
    Timeout { what: String, after: Duration },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("project '{0}' still owns sessions")]
    NotEmpty(String),
}

/// Coarse classification used for the "last error" slots and log policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    Config,
    MultiplexerUnavailable,
    Multiplexer,
    NotRunning,
    AlreadyRunning,
    NotFound,
    Parse,
    Vcs,
    Timeout,
    Io,
    InvariantViolation,
    NotEmpty,
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::MultiplexerUnavailable(_) => ErrorKind::MultiplexerUnavailable,
            Self::Multiplexer(_) => ErrorKind::Multiplexer,
            Self::NotRunning => ErrorKind::NotRunning,
            Self::AlreadyRunning => ErrorKind::AlreadyRunning,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Vcs(_) => ErrorKind::Vcs,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Io(_) => ErrorKind::Io,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::NotEmpty(_) => ErrorKind::NotEmpty,
        }
    }

    /// Errors that only cost one tick of data
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Multiplexer(_))
    }

    /// State-machine violations: reported to the UI, never logged
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::NotRunning | Self::AlreadyRunning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::NotRunning.is_soft());
        assert!(!Error::NotRunning.is_transient());
        let timeout = Error::Timeout {
            what: "capture-pane".into(),
            after: Duration::from_millis(2000),
        };
        assert!(timeout.is_transient());
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert_eq!(timeout.to_string(), "capture-pane timed out after 2000ms");
        assert_eq!(
            Error::not_found("window", "3").to_string(),
            "window not found: 3"
        );
    }
}
