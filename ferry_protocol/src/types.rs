// Plain data carried inside handshake and discovery packets.
//
// `GameData` is what a server hands a client when it accepts the login. The
// relay receives it on the upstream leg and replays it unchanged to the
// downstream client, so every field is opaque to the relay. `ServerStatus`
// is the answer to a discovery probe.
//
// Opaque byte fields are written as base64 strings (`base64_bytes`). A plain
// `Vec<u8>` would go out as a JSON array of numbers, up to four bytes per
// byte, and a few MiB of payload would no longer fit in one frame.

use serde::{Deserialize, Serialize};

/// Protocol revision spoken by this crate. Logins carrying any other value
/// are refused.
pub const PROTOCOL_VERSION: u32 = 1;

/// Initial world/session state sent by a server in `StartGame`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameData {
    pub world_name: String,
    pub entity_runtime_id: u64,
    /// Remaining start-game fields, encoded by the server.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// Status advertised to discovery probes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server_name: String,
    pub server_sub_name: String,
    pub player_count: usize,
    pub max_players: usize,
}

/// Serde adapter for byte fields: standard base64 in a JSON string.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self {
            server_name: "Ferry".into(),
            server_sub_name: String::new(),
            player_count: 0,
            max_players: 0,
        }
    }
}
