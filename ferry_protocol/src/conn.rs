// An established session with one peer.
//
// `Conn` wraps a `TcpStream` split into a buffered read half and a buffered
// write half, each behind its own lock, so one thread can block in
// `read_packet` while another writes. The relay's two forwarding loops rely
// on this: each loop reads one `Conn` and writes the other.
//
// Lifecycle:
// - A `Conn` starts open. `close()` and `disconnect()` flip a single
//   `closed` flag; only the call that flips it touches the socket, so both
//   are safe to call any number of times from any thread.
// - Shutting the socket down unblocks a reader parked in another thread.
//   That reader then sees `ConnError::Closed`.
// - Receiving a `Disconnect` packet records the peer's reason. From then on
//   every read and write fails with `ConnError::Disconnected(reason)`, which
//   is how a writer on one thread learns why the reader on another stopped.
//
// Handshake helpers (`start_game` for the server side, `do_spawn` for the
// client side) run under a read timeout that is cleared afterwards.
// `start_game` is `offer_game` followed by `confirm_spawn`; servers that
// need to act between the two steps call them directly.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{ConnError, DisconnectError};
use crate::framing::{read_packet, write_packet};
use crate::listener::Presence;
use crate::message::Packet;
use crate::types::GameData;

/// Read timeout applied while a spawn handshake is in progress.
pub const SPAWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `disconnect` waits for a busy write half before closing without
/// delivering the reason.
const DISCONNECT_WRITE_GRACE: Duration = Duration::from_secs(1);

/// Identity a client presented in its `Login`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginInfo {
    pub display_name: String,
    pub access_token: Option<String>,
}

pub struct Conn {
    peer_addr: SocketAddr,
    socket: TcpStream,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<BufWriter<TcpStream>>,
    closed: AtomicBool,
    remote_disconnect: OnceLock<DisconnectError>,
    pub(crate) login: Option<LoginInfo>,
    pub(crate) game_data: Option<GameData>,
    pub(crate) _presence: Option<Presence>,
}

impl Conn {
    pub(crate) fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream.try_clone()?);
        Ok(Self {
            peer_addr,
            socket: stream,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            remote_disconnect: OnceLock::new(),
            login: None,
            game_data: None,
            _presence: None,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The client's login, for sessions produced by `Listener::accept`.
    pub fn login(&self) -> Option<&LoginInfo> {
        self.login.as_ref()
    }

    /// The server's start-game state, for sessions produced by `Dialer::dial`.
    pub fn game_data(&self) -> Option<&GameData> {
        self.game_data.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The reason the peer gave when it disconnected, if it has.
    pub fn disconnect_reason(&self) -> Option<&str> {
        self.remote_disconnect.get().map(|err| err.reason.as_str())
    }

    /// Block until the next application message arrives.
    pub fn read_packet(&self) -> Result<Vec<u8>, ConnError> {
        match self.recv()? {
            Packet::Game { payload } => Ok(payload),
            other => Err(ConnError::UnexpectedPacket {
                stage: "relay",
                expected: "Game",
                got: other.kind(),
            }),
        }
    }

    /// Send one application message.
    pub fn write_packet(&self, payload: &[u8]) -> Result<(), ConnError> {
        self.send(&Packet::Game {
            payload: payload.to_vec(),
        })
    }

    /// Server side of the spawn handshake: hand the client its world state
    /// and wait until it reports itself initialised.
    pub fn start_game(&self, game_data: GameData) -> Result<(), ConnError> {
        self.offer_game(game_data)?;
        self.confirm_spawn()
    }

    /// First half of `start_game`: send `StartGame` and wait for the client's
    /// `RequestSpawn`.
    pub fn offer_game(&self, game_data: GameData) -> Result<(), ConnError> {
        self.with_read_timeout(SPAWN_TIMEOUT, || {
            self.send(&Packet::StartGame { game_data })?;
            self.expect("start game", &Packet::RequestSpawn)
        })
    }

    /// Second half of `start_game`: send `Spawned` and wait for `Initialised`.
    pub fn confirm_spawn(&self) -> Result<(), ConnError> {
        self.with_read_timeout(SPAWN_TIMEOUT, || {
            self.send(&Packet::Spawned)?;
            self.expect("start game", &Packet::Initialised)
        })
    }

    /// Client side of the spawn handshake, run after a successful dial.
    pub fn do_spawn(&self) -> Result<(), ConnError> {
        self.with_read_timeout(SPAWN_TIMEOUT, || {
            self.send(&Packet::RequestSpawn)?;
            self.expect("spawn", &Packet::Spawned)?;
            self.send(&Packet::Initialised)
        })
    }

    /// Tell the peer why the session is ending, then close it. A no-op on an
    /// already closed session.
    pub fn disconnect(&self, reason: &str) -> Result<(), ConnError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let packet = Packet::Disconnect {
            reason: reason.to_string(),
        };
        let sent = match self.writer.try_lock_for(DISCONNECT_WRITE_GRACE) {
            Some(mut writer) => write_packet(&mut *writer, &packet).map_err(ConnError::Io),
            None => Err(ConnError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "write half busy, disconnect reason not delivered",
            ))),
        };
        trace!(peer = %self.peer_addr, reason, "disconnecting");
        let shut = self.shutdown_socket().map_err(ConnError::Io);
        sent.and(shut)
    }

    /// Close the session without a reason. A no-op on an already closed
    /// session.
    pub fn close(&self) -> Result<(), ConnError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        trace!(peer = %self.peer_addr, "closing");
        self.shutdown_socket().map_err(ConnError::Io)
    }

    pub(crate) fn send(&self, packet: &Packet) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let mut writer = self.writer.lock();
        write_packet(&mut *writer, packet).map_err(|err| self.classify(err))
    }

    pub(crate) fn recv(&self) -> Result<Packet, ConnError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let result = read_packet(&mut *self.reader.lock());
        match result {
            Ok(Packet::Disconnect { reason }) => {
                let err = DisconnectError { reason };
                let _ = self.remote_disconnect.set(err.clone());
                if !self.closed.swap(true, Ordering::AcqRel) {
                    let _ = self.shutdown_socket();
                }
                Err(ConnError::Disconnected(err))
            }
            Ok(packet) => Ok(packet),
            Err(err) => Err(self.classify(err)),
        }
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    fn expect(&self, stage: &'static str, expected: &Packet) -> Result<(), ConnError> {
        let packet = self.recv()?;
        if &packet == expected {
            Ok(())
        } else {
            Err(ConnError::UnexpectedPacket {
                stage,
                expected: expected.kind(),
                got: packet.kind(),
            })
        }
    }

    fn with_read_timeout<T>(
        &self,
        timeout: Duration,
        f: impl FnOnce() -> Result<T, ConnError>,
    ) -> Result<T, ConnError> {
        self.set_read_timeout(Some(timeout)).map_err(|err| self.classify(err))?;
        let result = f();
        if result.is_ok() {
            self.set_read_timeout(None).map_err(|err| self.classify(err))?;
        }
        result
    }

    fn closed_error(&self) -> ConnError {
        match self.remote_disconnect.get() {
            Some(err) => ConnError::Disconnected(err.clone()),
            None => ConnError::Closed,
        }
    }

    /// Map an I/O failure to the most specific `ConnError` available: a
    /// recorded peer reason beats a local close, which beats the raw error.
    fn classify(&self, err: io::Error) -> ConnError {
        if self.remote_disconnect.get().is_some() || self.is_closed() {
            return self.closed_error();
        }
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ConnError::PeerClosed,
            io::ErrorKind::InvalidData => ConnError::Malformed(err),
            _ => ConnError::Io(err),
        }
    }

    fn shutdown_socket(&self) -> io::Result<()> {
        match self.socket.shutdown(Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .field("remote_disconnect", &self.remote_disconnect.get())
            .finish_non_exhaustive()
    }
}
