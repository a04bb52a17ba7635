use thiserror::Error;

/// Store-layer error type.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Store error wrapper.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    /// Invalid identifier input.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// An organization, subject, role, group, resource or tuple is absent.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    /// Undeclared action/resource pair or another validation failure.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Duplicate identifier or tuple.
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// Missing or invalid API key on the machine channel.
    #[error("unauthorized")]
    Unauthorized,
    /// The caller cancelled a listing query before it completed.
    #[error("query cancelled")]
    Cancelled,
}

/// Stable, machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    AlreadyExists,
    Unauthorized,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Returns the wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidInput => "invalid_input",
            Self::AlreadyExists => "already_exists",
            Self::Unauthorized => "unauthorized",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl Error {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Returns the error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidInput(_) | Self::InvalidId(_) => ErrorKind::InvalidInput,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Store(_) => ErrorKind::Internal,
        }
    }

    /// Returns a message safe to show to callers.
    ///
    /// Store failures are reduced to a generic message so backend error text
    /// never crosses the boundary.
    pub fn public_message(&self) -> String {
        match self {
            Self::Store(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Maps the error to a transport status code.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::InvalidInput => 400,
            ErrorKind::Unauthorized => 403,
            _ => 500,
        }
    }
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}
