// One client's session pair: its downstream `Conn` (the game client) and the
// upstream `Conn` dialed on its behalf.
//
// State machine: `Pairing → Barrier → Relaying → Closing → Closed`.
//
// - **Pairing**: dial upstream. A dial failure skips straight to `Closing`.
// - **Barrier**: the downstream replays the upstream's `GameData` through
//   `start_game` while the upstream runs `do_spawn`. Both run on scoped
//   threads; each sets its readiness flag on success. `Barrier → Relaying`
//   is refused unless both flags are set.
// - **Relaying**: two scoped forwarding threads, one per direction. Each
//   reads its source and writes its destination until one of the two fails.
//   A direction blocked on a slow writer never stalls the other.
// - **Closing → Closed**: teardown closes the upstream and then disconnects
//   the downstream with the reason derived from the first recorded failure.
//
// First failure wins. `fail()` stores the cause in a `OnceLock`; only the
// call that stores it moves to `Closing` and runs teardown, and teardown
// itself is guarded by a compare-and-swap flag. Later failures from the
// other thread (usually the `Closed` error teardown itself provoked) are
// dropped.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use ferry_protocol::{Conn, ConnError, DialError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{Span, debug, info, info_span, warn};

/// Disconnect reason sent to a client when the upstream gave none.
pub const GENERIC_REASON: &str = "disconnected";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Downstream,
    Upstream,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Downstream => Side::Upstream,
            Side::Upstream => Side::Downstream,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Downstream => "downstream",
            Side::Upstream => "upstream",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairState {
    Pairing,
    Barrier,
    Relaying,
    Closing,
    Closed,
}

/// Why a pair ended. Every variant is terminal.
#[derive(Debug, Error)]
pub enum PairError {
    #[error("upstream dial failed: {0}")]
    DialFailed(#[source] DialError),

    #[error("{side} handshake failed: {source}")]
    HandshakeFailed { side: Side, source: ConnError },

    #[error("{side} closed the session: {}", .reason.as_deref().unwrap_or("no reason given"))]
    PeerDisconnected { side: Side, reason: Option<String> },

    #[error("{side} transport error: {source}")]
    TransportError { side: Side, source: ConnError },
}

impl PairError {
    /// Classify a read or write failure on `side` during relaying.
    pub fn from_relay(side: Side, err: ConnError) -> Self {
        match err {
            ConnError::Disconnected(err) => PairError::PeerDisconnected {
                side,
                reason: Some(err.reason),
            },
            ConnError::PeerClosed | ConnError::Closed => {
                PairError::PeerDisconnected { side, reason: None }
            }
            source => PairError::TransportError { side, source },
        }
    }

    /// The reason the client is disconnected with.
    pub fn client_reason(&self) -> String {
        match self {
            PairError::DialFailed(DialError::Rejected(err)) => err.reason.clone(),
            PairError::DialFailed(err) => format!("unable to connect to the server: {err}"),
            PairError::PeerDisconnected {
                side: Side::Upstream,
                reason: Some(reason),
            } => reason.clone(),
            PairError::HandshakeFailed {
                side: Side::Upstream,
                source: ConnError::Disconnected(err),
            }
            | PairError::TransportError {
                side: Side::Upstream,
                source: ConnError::Disconnected(err),
            } => err.reason.clone(),
            _ => GENERIC_REASON.to_string(),
        }
    }

    /// Whether the client ended the pair by leaving.
    pub fn is_client_close(&self) -> bool {
        matches!(
            self,
            PairError::PeerDisconnected {
                side: Side::Downstream,
                ..
            }
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid pair transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: PairState,
    pub to: PairState,
}

#[derive(Debug)]
struct StateInner {
    state: PairState,
    downstream_ready: bool,
    upstream_ready: bool,
    reached_relaying: bool,
}

/// Pair state plus the two barrier flags, changed together under one lock.
#[derive(Debug)]
pub struct StateCell {
    inner: Mutex<StateInner>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                state: PairState::Pairing,
                downstream_ready: false,
                upstream_ready: false,
                reached_relaying: false,
            }),
        }
    }

    pub fn state(&self) -> PairState {
        self.inner.lock().state
    }

    pub fn reached_relaying(&self) -> bool {
        self.inner.lock().reached_relaying
    }

    pub fn mark_ready(&self, side: Side) {
        let mut inner = self.inner.lock();
        match side {
            Side::Downstream => inner.downstream_ready = true,
            Side::Upstream => inner.upstream_ready = true,
        }
    }

    pub fn advance(&self, to: PairState) -> Result<(), InvalidTransition> {
        use PairState::*;

        let mut inner = self.inner.lock();
        let from = inner.state;
        let allowed = match (from, to) {
            (Pairing, Barrier) | (Pairing, Closing) => true,
            (Barrier, Relaying) => inner.downstream_ready && inner.upstream_ready,
            (Barrier, Closing) | (Relaying, Closing) | (Closing, Closed) => true,
            _ => false,
        };
        if !allowed {
            return Err(InvalidTransition { from, to });
        }
        inner.state = to;
        if to == Relaying {
            inner.reached_relaying = true;
        }
        Ok(())
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one pair, returned by `SessionPair::run`.
#[derive(Debug)]
pub struct PairReport {
    pub id: u64,
    pub final_state: PairState,
    pub reached_relaying: bool,
    /// The first recorded failure.
    pub cause: Option<PairError>,
    /// Messages forwarded client to server.
    pub to_upstream: u64,
    /// Messages forwarded server to client.
    pub to_downstream: u64,
}

pub struct SessionPair {
    id: u64,
    downstream: Conn,
    upstream: OnceLock<Conn>,
    state: StateCell,
    cause: OnceLock<PairError>,
    torn_down: AtomicBool,
    to_upstream: AtomicU64,
    to_downstream: AtomicU64,
}

impl SessionPair {
    pub fn new(id: u64, downstream: Conn) -> Self {
        Self {
            id,
            downstream,
            upstream: OnceLock::new(),
            state: StateCell::new(),
            cause: OnceLock::new(),
            torn_down: AtomicBool::new(false),
            to_upstream: AtomicU64::new(0),
            to_downstream: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> PairState {
        self.state.state()
    }

    /// Drive the pair to `Closed`. `dial` opens the upstream session.
    pub fn run(self, dial: impl FnOnce() -> Result<Conn, DialError>) -> PairReport {
        let client = self
            .downstream
            .login()
            .map(|login| login.display_name.clone())
            .unwrap_or_default();
        let span = info_span!(
            "pair",
            id = self.id,
            peer = %self.downstream.peer_addr(),
            %client,
        );

        span.in_scope(|| {
            match dial() {
                Ok(upstream) => {
                    debug!(upstream = %upstream.peer_addr(), "upstream dialed");
                    let _ = self.upstream.set(upstream);
                }
                Err(err) => {
                    self.fail(PairError::DialFailed(err));
                    return;
                }
            }
            if let Err(err) = self.state.advance(PairState::Barrier) {
                debug!(error = %err, "pair closed while dialing");
                return;
            }

            if self.barrier(&span) {
                info!("relaying");
                self.relay(&span);
            }
        });

        // Every exit path above has already torn down through `fail`; this
        // only matters if none did.
        self.teardown(GENERIC_REASON);
        self.finish(&span)
    }

    /// Run both handshakes. True when the pair moved on to `Relaying`.
    fn barrier(&self, span: &Span) -> bool {
        let Some(upstream) = self.upstream.get() else {
            return false;
        };
        let game_data = upstream.game_data().cloned().unwrap_or_default();

        thread::scope(|s| {
            s.spawn(|| {
                span.in_scope(|| match self.downstream.start_game(game_data) {
                    Ok(()) => self.state.mark_ready(Side::Downstream),
                    Err(source) => self.fail(PairError::HandshakeFailed {
                        side: Side::Downstream,
                        source,
                    }),
                })
            });
            s.spawn(|| {
                span.in_scope(|| match upstream.do_spawn() {
                    Ok(()) => self.state.mark_ready(Side::Upstream),
                    Err(source) => self.fail(PairError::HandshakeFailed {
                        side: Side::Upstream,
                        source,
                    }),
                })
            });
        });

        match self.state.advance(PairState::Relaying) {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "barrier not passed");
                false
            }
        }
    }

    fn relay(&self, span: &Span) {
        let Some(upstream) = self.upstream.get() else {
            return;
        };
        thread::scope(|s| {
            s.spawn(|| {
                span.in_scope(|| {
                    self.forward(Side::Downstream, &self.downstream, upstream, &self.to_upstream)
                })
            });
            s.spawn(|| {
                span.in_scope(|| {
                    self.forward(Side::Upstream, upstream, &self.downstream, &self.to_downstream)
                })
            });
        });
    }

    /// Copy messages from `source` to `dest` until either fails.
    fn forward(&self, from: Side, source: &Conn, dest: &Conn, forwarded: &AtomicU64) {
        loop {
            let payload = match source.read_packet() {
                Ok(payload) => payload,
                Err(err) => {
                    self.fail(PairError::from_relay(from, err));
                    return;
                }
            };
            if let Err(err) = dest.write_packet(&payload) {
                self.fail(PairError::from_relay(from.other(), err));
                return;
            }
            forwarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record `err` as the pair's cause if it is the first failure, and tear
    /// the pair down. Later failures are dropped.
    fn fail(&self, err: PairError) {
        let reason = err.client_reason();
        if let Err(late) = self.cause.set(err) {
            debug!(error = %late, "ignoring failure after teardown");
            return;
        }
        if let Some(cause) = self.cause.get() {
            if cause.is_client_close() {
                info!("client left");
            } else {
                warn!(error = %cause, reason = %reason, "pair failed");
            }
        }
        self.teardown(&reason);
    }

    /// Close the upstream, then disconnect the client with `reason`. Runs
    /// once; every later call returns immediately.
    fn teardown(&self, reason: &str) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        // Fails only when already closing, which is fine.
        let _ = self.state.advance(PairState::Closing);

        if let Some(upstream) = self.upstream.get() {
            if let Err(err) = upstream.close() {
                debug!(error = %err, "upstream close failed");
            }
        }
        if let Err(err) = self.downstream.disconnect(reason) {
            debug!(error = %err, "client disconnect not delivered");
        }

        let _ = self.state.advance(PairState::Closed);
    }

    fn finish(self, span: &Span) -> PairReport {
        let report = PairReport {
            id: self.id,
            final_state: self.state.state(),
            reached_relaying: self.state.reached_relaying(),
            to_upstream: self.to_upstream.load(Ordering::Relaxed),
            to_downstream: self.to_downstream.load(Ordering::Relaxed),
            cause: self.cause.into_inner(),
        };
        span.in_scope(|| {
            info!(
                to_upstream = report.to_upstream,
                to_downstream = report.to_downstream,
                "pair closed"
            )
        });
        report
    }
}
