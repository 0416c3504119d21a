//! Error types.
//!
//! Two layers of failure exist. [`FsError`] is what a filesystem delegate
//! reports; it is plain data that travels in the error envelope and leaves
//! the connection healthy. [`Error`] is what the protocol engine reports; its
//! `Io`, `Protocol` and `Version` variants end the connection.

use std::io;

/// Error reported by a filesystem or file delegate.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    /// End of stream
    #[error("EOF")]
    Eof,
    /// Any other failure, described by its message
    #[error("{0}")]
    Message(String),
}

impl FsError {
    pub fn msg(message: impl Into<String>) -> FsError {
        FsError::Message(message.into())
    }

    /// Error returned by capability methods a backend leaves unimplemented
    pub fn unsupported() -> FsError {
        FsError::msg("operation not supported")
    }

    pub fn is_eof(&self) -> bool {
        matches!(*self, FsError::Eof)
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        FsError::Message(e.to_string())
    }
}

/// Outcome of a data transfer that may carry a value and an error together,
/// such as a short read that hit the end of the file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partial<T> {
    pub value: T,
    pub error: Option<FsError>,
}

impl<T> Partial<T> {
    pub fn ok(value: T) -> Partial<T> {
        Partial { value, error: None }
    }

    pub fn with_error(value: T, error: FsError) -> Partial<T> {
        Partial {
            value,
            error: Some(error),
        }
    }

    pub fn is_eof(&self) -> bool {
        self.error.as_ref().is_some_and(FsError::is_eof)
    }

    /// Drop the value when an error is present
    pub fn into_result(self) -> Result<T, FsError> {
        match self.error {
            None => Ok(self.value),
            Some(e) => Err(e),
        }
    }
}

impl<T: Default> From<FsError> for Partial<T> {
    fn from(error: FsError) -> Self {
        Partial::with_error(T::default(), error)
    }
}

/// Error of the protocol engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Stream failure, including an expired deadline
    #[error("io: {0}")]
    Io(io::Error),

    /// The peer sent something that violates the protocol
    #[error("data: {0}")]
    Protocol(String),

    /// The handshake carried another protocol version
    #[error("protocol version mismatch: local {local}, peer {peer}")]
    Version { local: u32, peer: u32 },

    /// The delegate on the server failed; the connection is still usable
    #[error(transparent)]
    Remote(#[from] FsError),

    /// The connection was closed or broken by an earlier failure
    #[error("connection is closed")]
    Disconnected,
}

impl Error {
    pub fn protocol(message: impl Into<String>) -> Error {
        Error::Protocol(message.into())
    }

    /// If the server reported end of stream
    pub fn is_eof(&self) -> bool {
        matches!(*self, Error::Remote(FsError::Eof))
    }

    /// If the error leaves the connection unusable
    pub fn is_fatal(&self) -> bool {
        !matches!(*self, Error::Remote(_))
    }
}

// Decoders flag malformed input with `InvalidData`; everything else is the stream.
impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::InvalidData => Error::Protocol(e.to_string()),
            _ => Error::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let e: Error = io::Error::new(io::ErrorKind::InvalidData, "bad opcode").into();
        assert!(matches!(e, Error::Protocol(ref m) if m == "bad opcode"));
        assert!(e.is_fatal());

        let e: Error = io::Error::new(io::ErrorKind::TimedOut, "deadline").into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.is_fatal());
    }

    #[test]
    fn remote_errors_are_not_fatal() {
        let e = Error::from(FsError::Eof);
        assert!(e.is_eof());
        assert!(!e.is_fatal());
        assert_eq!(Error::from(FsError::msg("nope")).to_string(), "nope");
    }

    #[test]
    fn partial_results() {
        let p = Partial::with_error(3usize, FsError::Eof);
        assert!(p.is_eof());
        assert_eq!(p.clone().into_result(), Err(FsError::Eof));
        assert_eq!(Partial::ok(4usize).into_result(), Ok(4));

        let empty: Partial<Vec<String>> = FsError::msg("gone").into();
        assert!(empty.value.is_empty());
        assert!(!empty.is_eof());
    }
}
