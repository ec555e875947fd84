// ferry_protocol: the game protocol spoken on both legs of the Ferry relay.
//
// The relay (`ferry_relay`) is a server to game clients and a client to the
// real game server; both roles live here so the relay itself never touches
// sockets or frames directly.
//
// Module overview:
// - `types.rs`:    `GameData`, `ServerStatus`, `PROTOCOL_VERSION`.
// - `message.rs`:  The `Packet` enum and the handshake order.
// - `framing.rs`:  4-byte big-endian length prefix + JSON body.
// - `conn.rs`:     `Conn`, an established session: concurrent read/write
//                  halves, idempotent close/disconnect, typed peer
//                  disconnects, spawn handshakes.
// - `listener.rs`: `Listener` (server role): accept thread, login threads,
//                  discovery answers via `StatusProvider`.
// - `dialer.rs`:   `Dialer` (client role) with a `TokenSource`, and the
//                  `query_status` discovery probe.
// - `error.rs`:    `ConnError`, `DialError`, `AcceptError`.
//
// Design decisions:
// - **Blocking I/O on OS threads.** No async runtime; every session is
//   driven by the threads of whoever owns it.
// - **Application payloads are opaque `Vec<u8>`.** Only handshake and
//   disconnect packets have structure. Bytes travel as base64 strings.

pub mod conn;
pub mod dialer;
pub mod error;
pub mod framing;
pub mod listener;
pub mod message;
pub mod types;

pub use conn::{Conn, LoginInfo};
pub use dialer::{Dialer, TokenSource, query_status};
pub use error::{AcceptError, BoxError, ConnError, DialError, DisconnectError};
pub use framing::MAX_FRAME_SIZE;
pub use listener::{ListenConfig, Listener, StaticStatus, StatusProvider};
pub use message::Packet;
pub use types::{GameData, PROTOCOL_VERSION, ServerStatus};
