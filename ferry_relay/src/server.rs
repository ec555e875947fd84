// Downstream listener and accept loop.
//
// Architecture: one accept thread, one thread per session pair.
//
// - `start_relay` binds the `ferry_protocol::Listener` (whose own threads
//   handle logins and discovery probes) and starts the accept thread.
// - **Accept thread** (`accept_loop`): takes each logged-in client from
//   `Listener::accept()`, numbers it, and spawns a pair thread without
//   waiting on it. An accept I/O error ends the loop and is returned from
//   `RelayHandle::wait`; the binary treats it as fatal.
// - **Pair threads**: each runs `SessionPair::run` with its own upstream
//   dial. Nothing a pair does reaches the accept loop or another pair.
//
// Shutdown: `ShutdownTrigger::shutdown` closes the listener, which makes
// `accept()` return `AcceptError::Closed` and the accept thread exit. Pairs
// already running are left to end with their connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ferry_protocol::{AcceptError, ListenConfig, Listener, TokenSource};
use tracing::{info, warn};

use crate::config::{DEFAULT_LISTEN_ADDR, DEFAULT_PORT, TargetAddr};
use crate::discovery::{ForeignStatusProvider, STATUS_POLL_INTERVAL};
use crate::error::RelayError;
use crate::pair::SessionPair;
use crate::upstream::UpstreamDialer;

/// Configuration for starting a relay.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Downstream address; port 0 picks a free port.
    pub listen_addr: String,
    pub target: TargetAddr,
    /// Name the relay logs in to the upstream with.
    pub display_name: String,
    /// Zero means no limit.
    pub max_players: usize,
    pub dial_timeout: Duration,
    pub status_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.into(),
            target: TargetAddr::new("127.0.0.1", DEFAULT_PORT),
            display_name: "ferry".into(),
            max_players: 20,
            dial_timeout: Duration::from_secs(10),
            status_interval: STATUS_POLL_INTERVAL,
        }
    }
}

impl RelayConfig {
    pub fn new(target: TargetAddr) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }
}

/// Closes the relay's listener from another thread, e.g. a signal handler.
#[derive(Clone)]
pub struct ShutdownTrigger(Arc<Listener>);

impl ShutdownTrigger {
    pub fn shutdown(&self) {
        self.0.close();
    }
}

/// Handle returned by `start_relay` to control the running relay.
pub struct RelayHandle {
    local_addr: SocketAddr,
    listener: Arc<Listener>,
    thread: Option<thread::JoinHandle<Result<(), RelayError>>>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger(Arc::clone(&self.listener))
    }

    /// Stop accepting clients and wait for the accept thread to exit.
    pub fn stop(self) -> Result<(), RelayError> {
        self.listener.close();
        self.wait()
    }

    /// Block until the accept loop ends, through shutdown or an accept error.
    pub fn wait(mut self) -> Result<(), RelayError> {
        match self.thread.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            },
            None => Ok(()),
        }
    }
}

/// Bind the downstream listener and start accepting clients on a background
/// thread. Returns the handle and the bound address (useful with port 0).
pub fn start_relay(
    config: RelayConfig,
    token_source: Arc<dyn TokenSource>,
) -> Result<(RelayHandle, SocketAddr), RelayError> {
    let status = ForeignStatusProvider::start(config.target.clone(), config.status_interval);
    let listener = Listener::bind(
        config.listen_addr.as_str(),
        ListenConfig {
            status_provider: status,
            max_players: config.max_players,
            ..ListenConfig::default()
        },
    )
    .map_err(|source| RelayError::Bind {
        addr: config.listen_addr.clone(),
        source,
    })?;
    let listener = Arc::new(listener);
    let local_addr = listener.local_addr();

    let dialer = UpstreamDialer::new(
        config.target.clone(),
        token_source,
        config.display_name,
        config.dial_timeout,
    );
    info!(listen = %local_addr, target = %config.target, "relay listening");

    let thread = {
        let listener = Arc::clone(&listener);
        thread::Builder::new()
            .name("ferry-relay".into())
            .spawn(move || accept_loop(&listener, &dialer))
            .map_err(RelayError::Spawn)?
    };

    Ok((
        RelayHandle {
            local_addr,
            listener,
            thread: Some(thread),
        },
        local_addr,
    ))
}

/// Accept clients until the listener closes or fails.
fn accept_loop(listener: &Listener, dialer: &UpstreamDialer) -> Result<(), RelayError> {
    let mut next_id: u64 = 0;
    loop {
        let downstream = match listener.accept() {
            Ok(conn) => conn,
            Err(AcceptError::Closed) => {
                info!("listener closed, no longer accepting clients");
                return Ok(());
            }
            Err(AcceptError::Io(err)) => return Err(RelayError::Accept(err)),
        };

        next_id += 1;
        let id = next_id;
        let peer = downstream.peer_addr();
        info!(id, %peer, "client connected");

        let dialer = dialer.clone();
        let spawned = thread::Builder::new()
            .name(format!("ferry-pair-{id}"))
            .spawn(move || {
                SessionPair::new(id, downstream).run(|| dialer.dial());
            });
        if let Err(err) = spawned {
            warn!(id, %peer, error = %err, "cannot spawn pair thread, dropping client");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_protocol::{BoxError, DialError, Dialer};

    struct EmptyToken;

    impl TokenSource for EmptyToken {
        fn access_token(&self) -> Result<String, BoxError> {
            Ok(String::new())
        }
    }

    fn local_config(target: TargetAddr) -> RelayConfig {
        RelayConfig {
            listen_addr: "127.0.0.1:0".into(),
            dial_timeout: Duration::from_secs(2),
            status_interval: Duration::from_millis(100),
            ..RelayConfig::new(target)
        }
    }

    #[test]
    fn bind_conflict_is_reported() {
        let (first, addr) = start_relay(
            local_config(TargetAddr::new("127.0.0.1", 1)),
            Arc::new(EmptyToken),
        )
        .unwrap();

        let err = start_relay(
            RelayConfig {
                listen_addr: addr.to_string(),
                ..local_config(TargetAddr::new("127.0.0.1", 1))
            },
            Arc::new(EmptyToken),
        )
        .err()
        .unwrap();
        assert!(matches!(err, RelayError::Bind { .. }), "{err:?}");

        first.stop().unwrap();
    }

    #[test]
    fn shutdown_trigger_ends_accept_loop() {
        let (handle, addr) = start_relay(
            local_config(TargetAddr::new("127.0.0.1", 1)),
            Arc::new(EmptyToken),
        )
        .unwrap();
        assert_eq!(handle.local_addr(), addr);

        let trigger = handle.shutdown_trigger();
        let waiter = thread::spawn(move || handle.wait());
        trigger.shutdown();
        // A second shutdown is harmless.
        trigger.shutdown();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn unreachable_target_disconnects_each_client() {
        let dead_port = {
            let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            scratch.local_addr().unwrap().port()
        };
        let (handle, addr) = start_relay(
            local_config(TargetAddr::new("127.0.0.1", dead_port)),
            Arc::new(EmptyToken),
        )
        .unwrap();

        // The relay keeps accepting after each failed pair.
        for _ in 0..3 {
            match Dialer::default().dial(&addr.to_string()) {
                Err(DialError::Rejected(err)) => {
                    assert!(err.reason.contains("unable to connect"), "{}", err.reason)
                }
                other => panic!("expected rejection, got {other:?}"),
            }
        }

        handle.stop().unwrap();
    }
}
