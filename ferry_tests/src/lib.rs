// Test-only endpoints for relay integration tests.
//
// `MockUpstream` is a game server built on the real `ferry_protocol`
// `Listener`: it accepts the relay's logins and then completes the spawn
// handshake, kicks the relay partway through it, or rejects the login with a
// reason. `TestClient` is a game client
// built on the real `Dialer`. Both sides go through the same framing,
// handshake and disconnect code the relay itself uses; the only test-specific
// code is the blocking wrappers with timeouts.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use ferry_protocol::{
    BoxError, Conn, ConnError, DialError, Dialer, GameData, ListenConfig, Listener, LoginInfo,
    ServerStatus, StaticStatus, TokenSource,
};
use ferry_relay::config::TargetAddr;
use ferry_relay::server::{RelayConfig, RelayHandle, start_relay};

/// Default timeout for blocking waits.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep between polls in `wait_until`.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Token every test relay logs in to the mock upstream with.
pub const TEST_TOKEN: &str = "pipeline-token";

/// How the mock upstream answers each login.
#[derive(Clone, Debug)]
pub enum UpstreamBehaviour {
    /// Send `StartGame` with this state and complete the spawn handshake.
    Accept(GameData),
    /// Answer the login with a disconnect carrying this reason.
    RejectLogin(String),
    /// Send `StartGame`, wait for `RequestSpawn`, then disconnect with this
    /// reason instead of confirming the spawn.
    KickDuringSpawn(String),
}

/// One relay-to-upstream session, seen from the upstream.
pub struct UpstreamSession {
    pub conn: Conn,
    pub login: LoginInfo,
}

impl UpstreamSession {
    pub fn send(&self, payload: &[u8]) {
        self.conn.write_packet(payload).expect("upstream write failed");
    }

    pub fn recv(&self) -> Result<Vec<u8>, ConnError> {
        self.conn.read_packet()
    }

    /// Disconnect the relay with `reason`.
    pub fn kick(&self, reason: &str) {
        self.conn.disconnect(reason).expect("upstream kick failed");
    }
}

pub struct MockUpstream {
    addr: SocketAddr,
    sessions: Receiver<UpstreamSession>,
}

impl MockUpstream {
    pub fn start(behaviour: UpstreamBehaviour) -> Self {
        Self::start_with_status(behaviour, ServerStatus::default())
    }

    /// Start the mock, answering discovery probes with `status`.
    pub fn start_with_status(behaviour: UpstreamBehaviour, status: ServerStatus) -> Self {
        let listener = Listener::bind(
            "127.0.0.1:0",
            ListenConfig {
                status_provider: Arc::new(StaticStatus(status)),
                max_players: 0,
                ..ListenConfig::default()
            },
        )
        .expect("mock upstream bind failed");
        let addr = listener.local_addr();
        let (tx, sessions) = mpsc::channel();

        // Runs until the test process exits; the listener is never closed.
        thread::spawn(move || {
            while let Ok(conn) = listener.accept() {
                let tx = tx.clone();
                let behaviour = behaviour.clone();
                thread::spawn(move || {
                    let login = conn.login().cloned().expect("accepted conn has a login");
                    match behaviour {
                        UpstreamBehaviour::Accept(game_data) => {
                            if conn.start_game(game_data).is_ok() {
                                let _ = tx.send(UpstreamSession { conn, login });
                            }
                        }
                        UpstreamBehaviour::RejectLogin(reason) => {
                            let _ = conn.disconnect(&reason);
                        }
                        UpstreamBehaviour::KickDuringSpawn(reason) => {
                            if conn.offer_game(GameData::default()).is_ok() {
                                let _ = conn.disconnect(&reason);
                            }
                        }
                    }
                });
            }
        });

        Self { addr, sessions }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn target(&self) -> TargetAddr {
        TargetAddr::new("127.0.0.1", self.addr.port())
    }

    /// The next session that finished its spawn handshake. Sessions kicked
    /// during the spawn are never handed out.
    pub fn next_session(&self) -> UpstreamSession {
        match self.sessions.recv_timeout(WAIT_TIMEOUT) {
            Ok(session) => session,
            Err(RecvTimeoutError::Timeout) => panic!("timed out waiting for upstream session"),
            Err(RecvTimeoutError::Disconnected) => panic!("mock upstream stopped"),
        }
    }
}

/// A game client connected through the relay.
pub struct TestClient {
    conn: Conn,
}

impl TestClient {
    /// Log in through the relay at `addr` and complete the spawn handshake.
    pub fn connect(addr: SocketAddr, name: &str) -> Result<Self, DialError> {
        let client = Self::dial(addr, name)?;
        client.conn.do_spawn().map_err(DialError::Handshake)?;
        Ok(client)
    }

    /// Log in and receive `StartGame`, but stop short of spawning.
    pub fn dial(addr: SocketAddr, name: &str) -> Result<Self, DialError> {
        let conn = Dialer {
            display_name: name.into(),
            connect_timeout: WAIT_TIMEOUT,
            ..Dialer::default()
        }
        .dial(&addr.to_string())?;
        Ok(Self { conn })
    }

    /// Connect and return the reason the relay ends the session with,
    /// whichever step it arrives in.
    pub fn connect_until_disconnected(addr: SocketAddr, name: &str) -> Option<String> {
        match Self::connect(addr, name) {
            Ok(client) => client
                .recv()
                .err()
                .and_then(|err| err.disconnect_reason().map(str::to_owned)),
            Err(DialError::Rejected(err)) => Some(err.reason),
            Err(DialError::Handshake(err)) => err.disconnect_reason().map(str::to_owned),
            Err(_) => None,
        }
    }

    pub fn game_data(&self) -> Option<&GameData> {
        self.conn.game_data()
    }

    pub fn send(&self, payload: &[u8]) {
        self.conn.write_packet(payload).expect("client write failed");
    }

    pub fn recv(&self) -> Result<Vec<u8>, ConnError> {
        self.conn.read_packet()
    }

    /// Leave without a reason, like a client closing its socket.
    pub fn leave(&self) {
        self.conn.close().expect("client close failed");
    }
}

struct FixedToken;

impl TokenSource for FixedToken {
    fn access_token(&self) -> Result<String, BoxError> {
        Ok(TEST_TOKEN.into())
    }
}

/// Start a relay on a random port in front of `target`.
pub fn start_test_relay(target: TargetAddr) -> (RelayHandle, SocketAddr) {
    let config = RelayConfig {
        listen_addr: "127.0.0.1:0".into(),
        display_name: "test-relay".into(),
        dial_timeout: Duration::from_secs(2),
        status_interval: Duration::from_millis(50),
        ..RelayConfig::new(target)
    };
    start_relay(config, Arc::new(FixedToken)).expect("relay start failed")
}

/// Poll `f` until it returns `Some` or `WAIT_TIMEOUT` passes.
pub fn wait_until<T>(mut f: impl FnMut() -> Option<T>) -> T {
    let start = Instant::now();
    loop {
        if let Some(value) = f() {
            return value;
        }
        assert!(start.elapsed() < WAIT_TIMEOUT, "timed out waiting for condition");
        thread::sleep(POLL_INTERVAL);
    }
}
