// Packet vocabulary shared by both ends of every session.
//
// One enum covers both directions. The handshake packets are only valid in
// the order described below; after the handshake, only `Game` and
// `Disconnect` flow.
//
//   client                         server
//   Login ───────────────────────▶
//          ◀─────────────────────── StartGame | Disconnect
//   RequestSpawn ────────────────▶
//          ◀─────────────────────── Spawned
//   Initialised ─────────────────▶
//   Game ◀──────────────────────▶ Game
//
// A discovery probe is a connection whose first packet is `StatusRequest`;
// the server answers with `Status` and closes.
//
// `Game` payloads are opaque bytes, carried as base64 text. Neither this
// crate nor the relay ever looks inside them.

use serde::{Deserialize, Serialize};

use crate::types::{GameData, ServerStatus};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    /// First packet of a client session.
    Login {
        protocol_version: u32,
        display_name: String,
        access_token: Option<String>,
    },
    /// First packet of a discovery probe.
    StatusRequest,
    /// Answer to `StatusRequest`.
    Status { status: ServerStatus },
    /// Login accepted; carries the initial world state.
    StartGame { game_data: GameData },
    /// Client has applied `StartGame` and wants to spawn.
    RequestSpawn,
    /// Server acknowledges the spawn.
    Spawned,
    /// Client finished its handshake.
    Initialised,
    /// Application message.
    Game {
        #[serde(with = "crate::types::base64_bytes")]
        payload: Vec<u8>,
    },
    /// Session is ending, with a human-readable reason.
    Disconnect { reason: String },
}

impl Packet {
    /// Short name for logs and handshake errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Login { .. } => "Login",
            Packet::StatusRequest => "StatusRequest",
            Packet::Status { .. } => "Status",
            Packet::StartGame { .. } => "StartGame",
            Packet::RequestSpawn => "RequestSpawn",
            Packet::Spawned => "Spawned",
            Packet::Initialised => "Initialised",
            Packet::Game { .. } => "Game",
            Packet::Disconnect { .. } => "Disconnect",
        }
    }
}
