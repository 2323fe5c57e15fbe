//! Every cache operation reports failure with an [`Error`].  Callers
//! that speak in network result codes can map any error to the
//! [`NetError`] they would have seen with [`Error::net_error`].
use thiserror::Error;

/// Result type alias using the cache's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Network-style result codes for cache operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum NetError {
    /// The operation succeeded.
    Ok = 0,
    /// The operation is asynchronous; the result will be delivered
    /// later.
    IoPending = -1,
    /// Generic failure: corruption, already exists, not found, etc.
    Failed = -2,
    /// The caller passed a bad stream index, offset or size.
    InvalidArgument = -4,
    /// The operation is not supported by this backend (or mode).
    NotImplemented = -11,
    /// The write exceeds a size limit.
    InsufficientResources = -12,
}

impl NetError {
    /// Returns the result code for `result`.
    pub fn of<T>(result: &Result<T>) -> NetError {
        match result {
            Ok(_) => NetError::Ok,
            Err(e) => e.net_error(),
        }
    }
}

/// Errors that can occur while operating on a cache.
#[derive(Error, Debug)]
pub enum Error {
    /// There is no active entry for the key.
    #[error("no active entry for key")]
    NotFound,

    /// An active entry already exists for the key.
    #[error("an active entry already exists for key")]
    AlreadyExists,

    /// The backend detected corruption while entries were open, and
    /// rejects new operations until its deferred reset completes.
    #[error("backend is disabled until its pending reset completes")]
    Disabled,

    /// The backend was destroyed.
    #[error("backend was destroyed")]
    BackendGone,

    /// The operation was still queued when the backend shut down.
    #[error("operation was cancelled by backend shutdown")]
    Cancelled,

    /// Structurally invalid on-disk or in-memory state.
    #[error("corrupt cache state: {0}")]
    Corrupt(String),

    /// Bad stream index, offset or size.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A size limit would be exceeded.
    #[error("insufficient resources: {0}")]
    InsufficientResources(&'static str),

    /// The backend does not implement the operation.
    #[error("not implemented by the {0} backend")]
    NotImplemented(&'static str),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the network result code for this error.
    pub fn net_error(&self) -> NetError {
        match self {
            Error::InvalidArgument(_) => NetError::InvalidArgument,
            Error::InsufficientResources(_) => NetError::InsufficientResources,
            Error::NotImplemented(_) => NetError::NotImplemented,
            Error::NotFound
            | Error::AlreadyExists
            | Error::Disabled
            | Error::BackendGone
            | Error::Cancelled
            | Error::Corrupt(_)
            | Error::Io(_) => NetError::Failed,
        }
    }

    pub(crate) fn corrupt(what: impl std::fmt::Display) -> Error {
        Error::Corrupt(what.to_string())
    }
}

#[test]
fn test_net_error_codes() {
    assert_eq!(NetError::of(&Ok(())), NetError::Ok);
    assert_eq!(Error::NotFound.net_error(), NetError::Failed);
    assert_eq!(Error::AlreadyExists.net_error(), NetError::Failed);
    assert_eq!(
        Error::InsufficientResources("too big").net_error(),
        NetError::InsufficientResources
    );
    assert_eq!(
        Error::NotImplemented("blockfile").net_error(),
        NetError::NotImplemented
    );
    assert_eq!(
        Error::from(std::io::Error::from_raw_os_error(libc::EIO)).net_error(),
        NetError::Failed
    );
    assert_eq!(NetError::InsufficientResources as i32, -12);
}
