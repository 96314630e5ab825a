use std::io;

/// Structured disposition for every failure this crate can surface to a
/// caller. See the error-handling design for the full trigger/disposition
/// table; fatal conditions (signal-handler write failures, assertion
/// violations) abort the process instead of constructing one of these.
#[derive(thiserror::Error, Debug)]
pub enum ConMgrError {
    #[error("fd {0} failed fstat on registration")]
    InvalidFd(std::os::unix::io::RawFd),

    #[error("connection {0} has no live socket for this operation")]
    MissingSocket(String),

    #[error("fd-passing is only supported on AF_UNIX sockets")]
    NotASocket,

    #[error("invalid fd argument: {0}")]
    InvalidArg(std::os::unix::io::RawFd),

    #[error("listen spec {0:?} could not be parsed")]
    BadListenSpec(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ConMgrError {
    pub fn missing_socket(name: impl Into<String>) -> ConMgrError {
        ConMgrError::MissingSocket(name.into())
    }
}

pub type Result<T> = std::result::Result<T, ConMgrError>;
