//! Flat error-kind taxonomy, with a hand-written `Display`/`Error` pair and an `ErrorUtils`
//! convenience trait, covering the kinds the wider engine (not just the net layer) needs to
//! report through `on_sent`/`on_released`.

use std::fmt;
use std::io;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    ValueError,
    UvError,
    ProtocolError,
    AddrInUse,
    Fatal,
    TlsError,
    WriteError,
    NotInitialized,
    InProgress,
    Timeout,
    EnoMem,
    Shutdown,
    CannotConnect,
    /// Advisory, not an error: the message was accepted and queued.
    Queued,
    /// The message slot was already in use (double-send of the same `Message`).
    Used,
    /// Internal: a partial read, never surfaced to a callback.
    More,
    /// The writer already has an outstanding message on this connection.
    Busy,
    /// A queue was empty when a caller expected to find something in it.
    Empty,
    InitFail,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ValueError => "VALUE_ERROR",
            ErrorKind::UvError => "UV_ERROR",
            ErrorKind::ProtocolError => "PROTOCOL_ERROR",
            ErrorKind::AddrInUse => "EADDRINUSE",
            ErrorKind::Fatal => "FATAL",
            ErrorKind::TlsError => "TLS_ERROR",
            ErrorKind::WriteError => "WRITE_ERROR",
            ErrorKind::NotInitialized => "NOT_INITIALIZED",
            ErrorKind::InProgress => "IN_PROGRESS",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::EnoMem => "ENOMEM",
            ErrorKind::Shutdown => "SHUTDOWN",
            ErrorKind::CannotConnect => "CANNOT_CONNECT",
            ErrorKind::Queued => "QUEUED",
            ErrorKind::Used => "USED",
            ErrorKind::More => "MORE",
            ErrorKind::Busy => "BUSY",
            ErrorKind::Empty => "EMPTY",
            ErrorKind::InitFail => "INIT_FAIL",
        };
        f.write_str(name)
    }
}

/// A single error value carried through `on_sent`/`on_released`/`init`'s return path: a kind
/// plus an optional cause, with no separate `Wait`/`Fatal` split since the `More`/`Busy`/`Queued`
/// kinds already cover "try again".
#[derive(Debug)]
pub struct ChirpError {
    kind: ErrorKind,
    cause: Option<io::Error>,
}

impl ChirpError {
    pub fn new(kind: ErrorKind) -> ChirpError {
        ChirpError { kind, cause: None }
    }

    pub fn with_cause(kind: ErrorKind, cause: io::Error) -> ChirpError {
        ChirpError { kind, cause: Some(cause) }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for ChirpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.kind, cause),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for ChirpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for ChirpError {
    fn from(err: io::Error) -> ChirpError {
        ChirpError::with_cause(ErrorKind::UvError, err)
    }
}

impl From<chirp_support::TlsError> for ChirpError {
    fn from(err: chirp_support::TlsError) -> ChirpError {
        ChirpError::with_cause(ErrorKind::TlsError, io::Error::new(io::ErrorKind::Other, err.to_string()))
    }
}

impl From<std::net::AddrParseError> for ChirpError {
    fn from(err: std::net::AddrParseError) -> ChirpError {
        ChirpError::with_cause(ErrorKind::ValueError, io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))
    }
}

pub type ChirpResult<T> = Result<T, ChirpError>;

/// A one-line "did this fail" check so call sites don't have to match on `Result` just to
/// decide whether to log and move on.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for ChirpResult<T> {
    fn has_failed(&self) -> bool {
        self.is_err()
    }
}
