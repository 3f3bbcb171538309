//! Engine-wide error type
//!
//! **Why**: Playback must never unwind through the tick path. Every fallible
//! operation returns `Result<T>` with one of the kinds below; decode errors
//! inside a running pipeline are downgraded to substitute frames before they
//! reach this type (see `io`).
//!
//! **Used by**: every module

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the engine
///
/// Kinds, not origins: callers branch on what went wrong, the payload string
/// carries the detail (path, time, codec message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Caller passed a value outside the documented domain (negative rate,
    /// empty path, zero-channel audio...)
    InvalidArgument(String),
    /// File missing, unrecognized container, permission denied
    OpenFailed(String),
    /// Requested time outside the declared media range
    OutOfRange(String),
    /// Codec reported an unrecoverable frame error
    DecodeFailed(String),
    /// Request cancelled by the pipeline or reader shutdown
    Cancelled,
    /// Writer received frames out of presentation order
    InvalidOrder(String),
    /// Cache could not evict enough to fit a new entry (everything pinned)
    ResourceExhausted(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            Error::OpenFailed(e) => write!(f, "Open failed: {}", e),
            Error::OutOfRange(e) => write!(f, "Out of range: {}", e),
            Error::DecodeFailed(e) => write!(f, "Decode failed: {}", e),
            Error::Cancelled => write!(f, "Cancelled"),
            Error::InvalidOrder(e) => write!(f, "Invalid order: {}", e),
            Error::ResourceExhausted(e) => write!(f, "Resource exhausted: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                Error::OpenFailed(e.to_string())
            }
            _ => Error::DecodeFailed(e.to_string()),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        match e {
            image::ImageError::IoError(io) => io.into(),
            image::ImageError::Unsupported(u) => Error::OpenFailed(u.to_string()),
            other => Error::DecodeFailed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::OpenFailed(format!("JSON parse: {}", e))
    }
}

impl Error {
    /// True when the error is the cancellation sentinel
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
