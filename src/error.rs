use std::error;
use std::fmt;
use std::io;

/// An error produced by a poller, transport or network helper.
///
/// Errors come in two kinds: system errors wrapping the platform error code
/// (`errno` or `GetLastError`), and library errors describing conditions the
/// crate itself detects, such as attaching an already-attached transport.
///
/// Structural calls ([`Poller::attach`] and friends) return errors directly.
/// Asynchronous I/O errors are delivered through the listener interfaces,
/// after the transport has been detached, so the listener observes a
/// terminal state.
///
/// [`Poller::attach`]: crate::Poller::attach
#[derive(Debug)]
pub enum Error {
    /// A system error, wrapping the platform error code.
    Io(io::Error),
    /// A condition detected by this crate.
    Library(LibraryError),
}

/// Conditions detected by the crate rather than the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LibraryError {
    /// The transport does not belong to this poller.
    IncompatibleTransport,
    /// The transport is already attached to a poller.
    AlreadyAttached,
    /// The transport has been closed.
    TransportClosed,
    /// The peer hung up for an unknown reason.
    UnknownHangup,
    /// Edge-triggered delivery was requested but the backend cannot provide
    /// it.
    EdgeTriggeringUnsupported,
    /// The I/O context is already associated with an in-flight operation.
    IncompatibleContext,
    /// The requested transfer length is out of range for the platform.
    LengthOutOfRange,
    /// The resolver could not translate an address.
    Resolution(String),
}

impl Error {
    /// Returns the last OS error as a system error value.
    pub fn last_os_error() -> Error {
        Error::Io(io::Error::last_os_error())
    }

    /// Returns true if this is a system error.
    pub fn is_system(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// The raw OS error code, if this is a system error that has one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(err) => err.raw_os_error(),
            Error::Library(_) => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => err.fmt(f),
            Error::Library(err) => err.fmt(f),
        }
    }
}

impl fmt::Display for LibraryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryError::IncompatibleTransport => f.write_str("incompatible transport"),
            LibraryError::AlreadyAttached => f.write_str("transport is already attached"),
            LibraryError::TransportClosed => f.write_str("transport is closed"),
            LibraryError::UnknownHangup => f.write_str("peer hung up for an unknown reason"),
            LibraryError::EdgeTriggeringUnsupported => {
                f.write_str("edge-triggering is not supported on this poller")
            }
            LibraryError::IncompatibleContext => {
                f.write_str("context is already associated with an operation")
            }
            LibraryError::LengthOutOfRange => f.write_str("length is out of range"),
            LibraryError::Resolution(msg) => write!(f, "could not resolve address: {}", msg),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Library(_) => None,
        }
    }
}

impl error::Error for LibraryError {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<LibraryError> for Error {
    fn from(err: LibraryError) -> Error {
        Error::Library(err)
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, LibraryError};
    use std::io;

    #[test]
    fn system_error_keeps_code() {
        let err = Error::Io(io::Error::from_raw_os_error(13));
        assert!(err.is_system());
        assert_eq!(err.raw_os_error(), Some(13));
    }

    #[test]
    fn library_error_has_no_code() {
        let err = Error::Library(LibraryError::TransportClosed);
        assert!(!err.is_system());
        assert_eq!(err.raw_os_error(), None);
        assert_eq!(err.to_string(), "transport is closed");
    }
}
