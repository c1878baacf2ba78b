use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Parse,
    NotFound,
    InvalidInput,
    RebuildInProgress,
    PersistenceUnavailable,
    CacheUnavailable,
    Cancelled,
    FatalInvariant,
    Internal,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    pub fn invalid_input(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidInput, context.into())
    }

    pub fn not_found(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotFound, context.into())
    }

    pub fn persistence(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::PersistenceUnavailable, context.into())
    }

    pub fn cache(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::CacheUnavailable, context.into())
    }

    pub fn cancelled(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Cancelled, context.into())
    }

    pub fn fatal(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::FatalInvariant, context.into())
    }

    /// Transient errors are safe to retry; ingestion does, up to its cap.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::PersistenceUnavailable | ErrorKind::CacheUnavailable
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::Parse,
            context: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
