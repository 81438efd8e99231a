//! Error Module
//!
//! Provides the single error type shared by every socket operation. Each
//! failure names the [`Operation`] that produced it and, where the OS reported
//! one, the raw error code captured right after the failing call.

use std::fmt;
use std::io;

/// The socket call that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Descriptor creation
    Create,
    /// Outbound connection (including hostname lookup)
    Connect,
    /// Binding to a local address
    Bind,
    /// Marking a descriptor passive
    Listen,
    /// Taking an incoming connection
    Accept,
    /// Transmitting bytes
    Send,
    /// Receiving bytes
    Recv,
    /// Shutting down transfer directions
    Shutdown,
    /// Buffered stream I/O
    Stream,
}

impl Operation {
    /// Short lowercase name, as used in error messages and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Connect => "connect",
            Operation::Bind => "bind",
            Operation::Listen => "listen",
            Operation::Accept => "accept",
            Operation::Send => "send",
            Operation::Recv => "recv",
            Operation::Shutdown => "shutdown",
            Operation::Stream => "stream",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network error
///
/// Every fallible operation in this crate returns `Result<T, NetworkError>`.
/// There is no local recovery: callers decide on retry or reconnection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// The OS rejected the call with `code` (an `errno` value)
    #[error("{op} failed: {} (os error {code})", os_message(.code))]
    Os { op: Operation, code: i32 },

    /// The peer shut the connection down; a transfer moved zero bytes
    #[error("{op} failed: connection closed by peer")]
    ConnectionClosed { op: Operation },

    /// The hostname could not be turned into an IPv4 endpoint
    #[error("cannot resolve `{host}`: {reason}")]
    Resolve { host: String, reason: String },

    /// The handle no longer owns a descriptor
    #[error("{op} failed: handle does not own a socket")]
    InvalidHandle { op: Operation },

    /// An I/O failure that carried no OS error code
    #[error("{op} failed: {message}")]
    Io {
        op: Operation,
        kind: io::ErrorKind,
        message: String,
    },
}

fn os_message(code: &i32) -> String {
    // io::Error's Display appends " (os error N)"; keep only the strerror text.
    let full = io::Error::from_raw_os_error(*code).to_string();
    match full.rfind(" (os error") {
        Some(idx) => full[..idx].to_string(),
        None => full,
    }
}

impl NetworkError {
    /// Classify an `io::Error` returned by `op`
    pub fn from_io(op: Operation, err: io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            return NetworkError::Os { op, code };
        }
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => {
                NetworkError::ConnectionClosed { op }
            }
            kind => NetworkError::Io {
                op,
                kind,
                message: err.to_string(),
            },
        }
    }

    /// Capture the calling thread's last OS error (`errno`) for `op`
    pub fn last_os_error(op: Operation) -> Self {
        Self::from_io(op, io::Error::last_os_error())
    }

    /// The operation that failed, if the error is tied to one
    pub fn operation(&self) -> Option<Operation> {
        match self {
            NetworkError::Os { op, .. }
            | NetworkError::ConnectionClosed { op }
            | NetworkError::InvalidHandle { op }
            | NetworkError::Io { op, .. } => Some(*op),
            NetworkError::Resolve { .. } => Some(Operation::Connect),
        }
    }

    /// The raw OS error code, when one was captured
    pub fn os_code(&self) -> Option<i32> {
        match self {
            NetworkError::Os { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this is an orderly end of stream rather than a hard failure
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, NetworkError::ConnectionClosed { .. })
    }
}

impl From<NetworkError> for io::Error {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::Os { code, .. } => io::Error::from_raw_os_error(code),
            NetworkError::ConnectionClosed { .. } => {
                io::Error::new(io::ErrorKind::UnexpectedEof, err)
            }
            NetworkError::Resolve { .. } => io::Error::new(io::ErrorKind::NotFound, err),
            NetworkError::InvalidHandle { .. } => io::Error::new(io::ErrorKind::NotConnected, err),
            NetworkError::Io { kind, .. } => io::Error::new(kind, err),
        }
    }
}
