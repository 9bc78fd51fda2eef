use crate::state::State;
use std::{
    error::Error as StdError,
    fmt::{Display, Formatter, Result as FmtResult},
    io::{self, ErrorKind},
    result,
};

/// A convenience wrapper around `Result` for `ktn::Error`.
pub type Result<T> = result::Result<T, Error>;

/// The ways a connection operation can fail.
///
/// Transient network anomalies (corrupted, duplicated, reordered or foreign
/// packets) are recovered from inside the connection and never show up here.
#[derive(Debug)]
pub enum Error {
    /// Data was sent or received outside of the `ESTABLISHED` state.
    NotConnected,

    /// `connect` or `accept` got no valid reply within the retry budget.
    HandshakeTimeout,

    /// The resend or receive budget was exhausted. The connection has been
    /// forced into `CLOSED`.
    ConnectionLost,

    /// The peer has closed its side of the connection.
    ///
    /// The connection is now in `CLOSE_WAIT` and should be `close`d to
    /// finish the passive teardown.
    EndOfStream,

    /// An expected ACK or FIN did not arrive during `close`.
    ///
    /// The connection stays in whatever teardown state it had reached.
    TeardownFailure(&'static str),

    /// The operation is not defined for the current state.
    InvalidState {
        operation: &'static str,
        state: State,
    },

    /// The underlying transport failed.
    Io(io::Error),
}

impl Error {
    /// Whether this error leaves the connection unusable for data transfer.
    pub fn is_terminal(&self) -> bool {
        match self {
            Error::ConnectionLost | Error::Io(_) => true,
            _ => false,
        }
    }
}

impl Display for Error {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        match self {
            Error::NotConnected => "connection not established".fmt(fmt),
            Error::HandshakeTimeout => "timed out during the handshake".fmt(fmt),
            Error::ConnectionLost => "connection lost".fmt(fmt),
            Error::EndOfStream => "peer closed the connection".fmt(fmt),
            Error::TeardownFailure(what) => write!(fmt, "teardown failed: {}", what),
            Error::InvalidState { operation, state } => {
                write!(fmt, "cannot {} in state {}", operation, state)
            }
            Error::Io(err) => write!(fmt, "transport error: {}", err),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::Io(inner) => return inner,
            Error::NotConnected => ErrorKind::NotConnected,
            Error::HandshakeTimeout => ErrorKind::TimedOut,
            Error::ConnectionLost => ErrorKind::ConnectionAborted,
            Error::EndOfStream => ErrorKind::UnexpectedEof,
            Error::InvalidState { .. } => ErrorKind::InvalidInput,
            Error::TeardownFailure(_) => ErrorKind::Other,
        };

        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kind_mapping() {
        let cases = vec![
            (Error::NotConnected, ErrorKind::NotConnected),
            (Error::HandshakeTimeout, ErrorKind::TimedOut),
            (Error::ConnectionLost, ErrorKind::ConnectionAborted),
            (Error::EndOfStream, ErrorKind::UnexpectedEof),
            (Error::TeardownFailure("no ACK"), ErrorKind::Other),
        ];

        for (err, kind) in cases {
            assert_eq!(io::Error::from(err).kind(), kind);
        }
    }

    #[test]
    fn io_error_passes_through() {
        let err = Error::from(io::Error::new(ErrorKind::AddrInUse, "taken"));
        assert!(err.source().is_some());
        assert_eq!(io::Error::from(err).kind(), ErrorKind::AddrInUse);
    }

    #[test]
    fn display_invalid_state() {
        let err = Error::InvalidState {
            operation: "close",
            state: State::FinWait2,
        };
        assert_eq!(err.to_string(), "cannot close in state FIN_WAIT_2");
    }
}
