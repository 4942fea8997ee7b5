//! The error taxonomy every layer of the runtime translates OS/library errors into.
//!
//! Recoverable conditions (`WouldBlock`, `Interrupted`) are absorbed by the event loop
//! and never escape to a user callback; everything else is surfaced verbatim.

use std::fmt;
use std::io;

/// A translated error, stable across the concrete driver backend and OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Ok,
    WouldBlock,
    Interrupted,
    Eof,
    ConnectionDead,
    ConnectionRefused,
    ConnectionReset,
    Cancelled,
    Timeout,
    AddressInUse,
    AddressNotAvailable,
    NotConnected,
    AlreadyConnected,
    PermissionDenied,
    NotSupported,
    Invalid,
    LimitExceeded,
    Unknown,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the event loop may absorb this error and retry rather than surface it.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Error::WouldBlock | Error::Interrupted)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Ok => "ok",
            Error::WouldBlock => "operation would block",
            Error::Interrupted => "operation interrupted",
            Error::Eof => "end of file",
            Error::ConnectionDead => "connection is dead",
            Error::ConnectionRefused => "connection refused",
            Error::ConnectionReset => "connection reset by peer",
            Error::Cancelled => "operation cancelled",
            Error::Timeout => "operation timed out",
            Error::AddressInUse => "address already in use",
            Error::AddressNotAvailable => "address not available",
            Error::NotConnected => "socket is not connected",
            Error::AlreadyConnected => "socket is already connected",
            Error::PermissionDenied => "permission denied",
            Error::NotSupported => "operation not supported",
            Error::Invalid => "invalid argument",
            Error::LimitExceeded => "resource limit exceeded",
            Error::Unknown => "unknown error",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        use io::ErrorKind::*;

        match err.kind() {
            WouldBlock => Error::WouldBlock,
            Interrupted => Error::Interrupted,
            UnexpectedEof => Error::Eof,
            ConnectionRefused => Error::ConnectionRefused,
            ConnectionReset | ConnectionAborted => Error::ConnectionReset,
            NotConnected => Error::NotConnected,
            AddrInUse => Error::AddressInUse,
            AddrNotAvailable => Error::AddressNotAvailable,
            PermissionDenied => Error::PermissionDenied,
            InvalidInput | InvalidData => Error::Invalid,
            TimedOut => Error::Timeout,
            _ => match err.raw_os_error() {
                Some(libc::EPIPE) | Some(libc::ESHUTDOWN) => Error::ConnectionDead,
                Some(libc::EALREADY) => Error::AlreadyConnected,
                Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM) => {
                    Error::LimitExceeded
                }
                Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) => Error::NotSupported,
                _ => Error::Unknown,
            },
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match err {
            Error::Ok => return io::Error::new(io::ErrorKind::Other, "ok"),
            Error::WouldBlock => io::ErrorKind::WouldBlock,
            Error::Interrupted => io::ErrorKind::Interrupted,
            Error::Eof => io::ErrorKind::UnexpectedEof,
            Error::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            Error::ConnectionReset | Error::ConnectionDead => io::ErrorKind::ConnectionReset,
            Error::NotConnected => io::ErrorKind::NotConnected,
            Error::AddressInUse => io::ErrorKind::AddrInUse,
            Error::AddressNotAvailable => io::ErrorKind::AddrNotAvailable,
            Error::PermissionDenied => io::ErrorKind::PermissionDenied,
            Error::Invalid => io::ErrorKind::InvalidInput,
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::Cancelled
            | Error::AlreadyConnected
            | Error::NotSupported
            | Error::LimitExceeded
            | Error::Unknown => io::ErrorKind::Other,
        };
        io::Error::new(kind, err.to_string())
    }
}

/// Accompanies an error (or a success) back to a user callback, carrying whatever
/// progress was made before the outcome was known.
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub bytes_transferred: usize,
}

impl Context {
    pub fn new(bytes_transferred: usize) -> Context {
        Context { bytes_transferred }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recoverable_errors_are_absorbable() {
        assert!(Error::WouldBlock.is_recoverable());
        assert!(Error::Interrupted.is_recoverable());
        assert!(!Error::ConnectionReset.is_recoverable());
    }

    #[test]
    fn io_error_roundtrip_preserves_category() {
        let io_err = io::Error::from(io::ErrorKind::ConnectionReset);
        let err: Error = io_err.into();
        assert_eq!(err, Error::ConnectionReset);
    }
}
