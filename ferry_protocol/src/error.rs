// Error types for sessions, dialing and accepting.

use std::io;

use thiserror::Error;

/// Boxed error returned by a `TokenSource`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The remote end closed the session with a reason.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct DisconnectError {
    pub reason: String,
}

/// Failure of a read, write or handshake step on a `Conn`.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("disconnected by peer: {0}")]
    Disconnected(DisconnectError),

    /// The session was closed locally.
    #[error("use of closed connection")]
    Closed,

    /// The remote end went away without sending a `Disconnect`.
    #[error("connection closed by peer")]
    PeerClosed,

    #[error("unexpected {got} packet during {stage} (expected {expected})")]
    UnexpectedPacket {
        stage: &'static str,
        expected: &'static str,
        got: &'static str,
    },

    #[error("malformed packet: {0}")]
    Malformed(io::Error),

    #[error(transparent)]
    Io(io::Error),
}

impl ConnError {
    /// The peer's reason, when this error is a typed disconnect.
    pub fn disconnect_reason(&self) -> Option<&str> {
        match self {
            ConnError::Disconnected(err) => Some(&err.reason),
            _ => None,
        }
    }
}

/// Failure to open a client session.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("cannot resolve {addr}: {source}")]
    Resolve { addr: String, source: io::Error },

    #[error("cannot connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("cannot obtain access token: {0}")]
    Token(BoxError),

    /// The server answered the login with a `Disconnect`.
    #[error("login rejected: {0}")]
    Rejected(DisconnectError),

    #[error("login handshake failed: {0}")]
    Handshake(ConnError),
}

/// Failure of `Listener::accept`.
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("listener closed")]
    Closed,

    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}
