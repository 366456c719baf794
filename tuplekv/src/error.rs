use serde_derive::{Deserialize, Serialize};

/// Crate-wide result type, using the crate Error.
pub type CResult<T> = std::result::Result<T, Error>;

/// All errors surfaced by the stores and the engine adapter.
///
/// Engine errors carry the numeric status code reported by the engine;
/// the transaction harness recovers the retryable ones via on_error and
/// surfaces the rest. Every other variant is fatal and bypasses retry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Nonzero status returned by the storage engine.
    Engine { code: i32, message: String },

    /// The caller misused an API: wrong arity, missing active change,
    /// unsplittable key, and so on.
    InvalidInput(String),

    /// Persisted state does not satisfy a store invariant.
    InvalidData(String),

    /// A bug in this crate, not recoverable by the caller.
    Internal(String),
}

impl Error {
    /// An engine error with the human-readable description for the code.
    pub fn engine(code: i32) -> Self {
        Error::Engine { code, message: describe(code).to_string() }
    }
}

/// Description of an engine status code, for known codes.
pub fn describe(code: i32) -> &'static str {
    match code {
        1007 => "transaction too old",
        1009 => "request for future version",
        1020 => "transaction not committed due to conflict",
        1021 => "commit result unknown",
        2101 => "transaction exceeds byte limit",
        2102 => "key exceeds length limit",
        2103 => "value exceeds length limit",
        2203 => "api version not supported",
        _ => "engine error",
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Engine { code, message } => write!(f, "engine error {}: {}", code, message),
            Error::InvalidInput(message) => write!(f, "invalid input: {}", message),
            Error::InvalidData(message) => write!(f, "invalid data: {}", message),
            Error::Internal(message) => write!(f, "internal error: {}", message),
        }
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}
