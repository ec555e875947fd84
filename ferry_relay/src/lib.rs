// ferry_relay: transparent relay between game clients and one upstream
// game server.
//
// Each client that logs in to the relay gets its own upstream session, dialed
// with the relay's shared credential. Once both sessions have finished their
// spawn handshakes the relay copies opaque game packets in both directions
// until either side leaves, then tears both down and tells the client why.
//
// Module overview:
// - `config.rs`:     `TargetAddr` parsing, listen/credential defaults, the
//                    `Enter Server: ` prompt.
// - `credential.rs`: `Credential`, the on-disk `CredentialCache`, the
//                    `TokenAuthority` seam, and the shared
//                    `RefreshingTokenSource` (single-flight refresh).
// - `live.rs`:       `LiveDeviceAuth`, the device-code sign-in authority.
// - `upstream.rs`:   `UpstreamDialer`, one dial per client.
// - `pair.rs`:       `SessionPair`, the per-client state machine: dial,
//                    handshake barrier, two forwarding loops, teardown.
// - `discovery.rs`:  `ForeignStatusProvider`, mirroring the upstream's
//                    discovery status.
// - `server.rs`:     `start_relay`, the accept loop, `RelayHandle`.
// - `error.rs`:      `RelayError`, the process-fatal failures.
//
// Dependencies: `ferry_protocol` for every socket and frame. The relay never
// looks inside a game packet.
//
// The relay runs as a standalone binary (`main.rs`) or embedded through the
// library API (`start_relay`), which is how the tests drive it.

pub mod config;
pub mod credential;
pub mod discovery;
pub mod error;
pub mod live;
pub mod pair;
pub mod server;
pub mod upstream;

pub use config::TargetAddr;
pub use credential::{CredentialCache, RefreshingTokenSource};
pub use error::RelayError;
pub use pair::{PairError, PairReport, PairState, SessionPair};
pub use server::{RelayConfig, RelayHandle, ShutdownTrigger, start_relay};
