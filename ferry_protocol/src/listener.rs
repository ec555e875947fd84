// Server side of the protocol: bind, answer discovery probes, accept logins.
//
// Architecture follows a listener-thread-plus-channel shape:
//
// - **Accept thread**: polls a non-blocking `TcpListener` so it can notice
//   `close()`. Each new TCP connection is handed to its own login thread.
//   A hard accept error is forwarded through the channel and ends the
//   thread; `accept()` then returns it to the caller.
// - **Login threads** (one per incoming connection, short-lived): read the
//   first packet under `login_timeout`. A `StatusRequest` is answered from
//   the `StatusProvider` and closed. A `Login` is version-checked and, when
//   accepted, the resulting `Conn` is sent to the channel.
// - **`accept()`**: receives finished logins from the channel. Slow or
//   silent clients never stall it.
//
// The listener keeps a live player count: every accepted `Conn` carries a
// `Presence` guard that decrements the count when the session is dropped.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::conn::{Conn, LoginInfo};
use crate::error::AcceptError;
use crate::message::Packet;
use crate::types::{PROTOCOL_VERSION, ServerStatus};

/// Poll interval for the non-blocking accept loop and for `accept()`
/// noticing a close.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Supplies the status shown to discovery probes.
pub trait StatusProvider: Send + Sync {
    fn server_status(&self, player_count: usize, max_players: usize) -> ServerStatus;
}

/// A fixed name and sub-name; counts come from the listener.
#[derive(Clone, Debug, Default)]
pub struct StaticStatus(pub ServerStatus);

impl StatusProvider for StaticStatus {
    fn server_status(&self, player_count: usize, max_players: usize) -> ServerStatus {
        ServerStatus {
            player_count,
            max_players,
            ..self.0.clone()
        }
    }
}

#[derive(Clone)]
pub struct ListenConfig {
    pub status_provider: Arc<dyn StatusProvider>,
    /// Logins beyond this many live sessions are refused. Zero means no limit.
    pub max_players: usize,
    pub login_timeout: Duration,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            status_provider: Arc::new(StaticStatus::default()),
            max_players: 20,
            login_timeout: Duration::from_secs(5),
        }
    }
}

/// Decrements the listener's player count when the owning `Conn` drops.
pub(crate) struct Presence(Arc<AtomicUsize>);

impl Presence {
    /// Take one of `max` slots, or `None` when all are taken. Zero means no
    /// limit. Check and increment are one atomic step.
    fn try_enter(count: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .ok()?;
        Some(Self(Arc::clone(count)))
    }
}

impl Drop for Presence {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Listener {
    local_addr: SocketAddr,
    incoming: Mutex<Receiver<io::Result<Conn>>>,
    keep_running: Arc<AtomicBool>,
    players: Arc<AtomicUsize>,
}

impl Listener {
    /// Bind `addr` and start accepting in the background.
    pub fn bind<A: ToSocketAddrs>(addr: A, config: ListenConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let (tx, rx) = mpsc::channel();
        let keep_running = Arc::new(AtomicBool::new(true));
        let players = Arc::new(AtomicUsize::new(0));

        let acceptor = Acceptor {
            listener,
            tx,
            config,
            keep_running: Arc::clone(&keep_running),
            players: Arc::clone(&players),
        };
        thread::Builder::new()
            .name("ferry-accept".into())
            .spawn(move || acceptor.run())?;

        Ok(Self {
            local_addr,
            incoming: Mutex::new(rx),
            keep_running,
            players,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sessions accepted by this listener that are still alive.
    pub fn player_count(&self) -> usize {
        self.players.load(Ordering::SeqCst)
    }

    /// Block until a client completes its login.
    ///
    /// Returns `AcceptError::Closed` once `close()` has been called, and
    /// `AcceptError::Io` if the listening socket itself failed.
    pub fn accept(&self) -> Result<Conn, AcceptError> {
        let incoming = self.incoming.lock();
        loop {
            if !self.keep_running.load(Ordering::SeqCst) {
                return Err(AcceptError::Closed);
            }
            match incoming.recv_timeout(ACCEPT_POLL_INTERVAL) {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(err)) => return Err(AcceptError::Io(err)),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(AcceptError::Closed),
            }
        }
    }

    /// Stop accepting. Sessions already handed out are unaffected.
    pub fn close(&self) {
        self.keep_running.store(false, Ordering::SeqCst);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

struct Acceptor {
    listener: TcpListener,
    tx: Sender<io::Result<Conn>>,
    config: ListenConfig,
    keep_running: Arc<AtomicBool>,
    players: Arc<AtomicUsize>,
}

impl Acceptor {
    fn run(self) {
        while self.keep_running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => self.spawn_login(stream, addr),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(ref err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => {
                    let _ = self.tx.send(Err(err));
                    break;
                }
            }
        }
        debug!(addr = ?self.listener.local_addr().ok(), "accept thread stopped");
    }

    fn spawn_login(&self, stream: TcpStream, addr: SocketAddr) {
        let tx = self.tx.clone();
        let config = self.config.clone();
        let players = Arc::clone(&self.players);
        let spawned = thread::Builder::new()
            .name("ferry-login".into())
            .spawn(move || {
                if let Err(err) = handle_login(stream, &tx, &config, &players) {
                    debug!(%addr, error = %err, "incoming connection dropped");
                }
            });
        if let Err(err) = spawned {
            warn!(%addr, error = %err, "cannot spawn login thread");
        }
    }
}

/// Read the first packet of a new connection and act on it.
fn handle_login(
    stream: TcpStream,
    tx: &Sender<io::Result<Conn>>,
    config: &ListenConfig,
    players: &Arc<AtomicUsize>,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let mut conn = Conn::new(stream)?;
    conn.set_read_timeout(Some(config.login_timeout))?;

    let first = conn.recv().map_err(io::Error::other)?;
    match first {
        Packet::StatusRequest => {
            let status = config
                .status_provider
                .server_status(players.load(Ordering::SeqCst), config.max_players);
            let _ = conn.send(&Packet::Status { status });
            let _ = conn.close();
        }
        Packet::Login {
            protocol_version,
            display_name,
            access_token,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                let reason = if protocol_version < PROTOCOL_VERSION {
                    "outdated client"
                } else {
                    "outdated server"
                };
                let _ = conn.disconnect(reason);
                return Ok(());
            }
            let Some(presence) = Presence::try_enter(players, config.max_players) else {
                let _ = conn.disconnect("server is full");
                return Ok(());
            };
            conn._presence = Some(presence);
            conn.set_read_timeout(None)?;
            debug!(peer = %conn.peer_addr(), %display_name, "login accepted");
            conn.login = Some(LoginInfo {
                display_name,
                access_token,
            });
            // A closed receiver means the listener is gone; the session is
            // dropped with it.
            let _ = tx.send(Ok(conn));
        }
        other => {
            debug!(peer = %conn.peer_addr(), kind = other.kind(), "unexpected first packet");
            let _ = conn.close();
        }
    }
    Ok(())
}
