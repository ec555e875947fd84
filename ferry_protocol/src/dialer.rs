// Client side of the protocol: open a session to a server.
//
// `Dialer::dial` resolves the address, connects with a timeout, sends
// `Login` with a token drawn from the optional `TokenSource`, and waits for
// `StartGame`. The returned `Conn` carries the server's `GameData`; the
// caller still has to run `Conn::do_spawn` before exchanging game packets.
//
// `query_status` is the discovery probe: connect, ask for `Status`, return
// the answer.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::conn::Conn;
use crate::error::{BoxError, ConnError, DialError};
use crate::message::Packet;
use crate::types::{PROTOCOL_VERSION, ServerStatus};

/// Supplies the access token sent in `Login`. Implementations are shared by
/// every concurrent dial and refresh the token as needed.
pub trait TokenSource: Send + Sync {
    fn access_token(&self) -> Result<String, BoxError>;
}

#[derive(Clone)]
pub struct Dialer {
    pub display_name: String,
    pub token_source: Option<Arc<dyn TokenSource>>,
    /// Bounds both the TCP connect and the wait for `StartGame`.
    pub connect_timeout: Duration,
}

impl Default for Dialer {
    fn default() -> Self {
        Self {
            display_name: "ferry".into(),
            token_source: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Dialer {
    /// Open a logged-in session to `addr` (`host:port`).
    pub fn dial(&self, addr: &str) -> Result<Conn, DialError> {
        let access_token = match &self.token_source {
            Some(source) => Some(source.access_token().map_err(DialError::Token)?),
            None => None,
        };

        let stream = connect(addr, self.connect_timeout)?;
        let mut conn = Conn::new(stream).map_err(|source| DialError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        conn.set_read_timeout(Some(self.connect_timeout))
            .map_err(|err| DialError::Handshake(ConnError::Io(err)))?;

        conn.send(&Packet::Login {
            protocol_version: PROTOCOL_VERSION,
            display_name: self.display_name.clone(),
            access_token,
        })
        .map_err(DialError::Handshake)?;

        match conn.recv() {
            Ok(Packet::StartGame { game_data }) => conn.game_data = Some(game_data),
            Ok(other) => {
                return Err(DialError::Handshake(ConnError::UnexpectedPacket {
                    stage: "login",
                    expected: "StartGame",
                    got: other.kind(),
                }));
            }
            Err(ConnError::Disconnected(err)) => return Err(DialError::Rejected(err)),
            Err(err) => return Err(DialError::Handshake(err)),
        }

        conn.set_read_timeout(None)
            .map_err(|err| DialError::Handshake(ConnError::Io(err)))?;
        debug!(%addr, "dialed");
        Ok(conn)
    }
}

/// Ask the server at `addr` for its discovery status.
pub fn query_status(addr: &str, timeout: Duration) -> Result<ServerStatus, DialError> {
    let stream = connect(addr, timeout)?;
    let conn = Conn::new(stream).map_err(|source| DialError::Connect {
        addr: addr.to_string(),
        source,
    })?;
    conn.set_read_timeout(Some(timeout))
        .map_err(|err| DialError::Handshake(ConnError::Io(err)))?;
    conn.send(&Packet::StatusRequest)
        .map_err(DialError::Handshake)?;

    let result = match conn.recv() {
        Ok(Packet::Status { status }) => Ok(status),
        Ok(other) => Err(DialError::Handshake(ConnError::UnexpectedPacket {
            stage: "status",
            expected: "Status",
            got: other.kind(),
        })),
        Err(ConnError::Disconnected(err)) => Err(DialError::Rejected(err)),
        Err(err) => Err(DialError::Handshake(err)),
    };
    let _ = conn.close();
    result
}

/// Connect to the first reachable address `addr` resolves to.
fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, DialError> {
    let candidates: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(|source| DialError::Resolve {
            addr: addr.to_string(),
            source,
        })?
        .collect();

    let mut last_err = None;
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(DialError::Connect {
        addr: addr.to_string(),
        source: last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
        }),
    })
}
