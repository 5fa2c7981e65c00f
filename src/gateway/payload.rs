use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::opcode::Opcode;

/// One inbound gateway message. `s` and `t` are only set on dispatches.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn opcode(&self) -> Result<Opcode, u8> {
        Opcode::try_from(self.op)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionProperties {
    #[serde(rename = "$os")]
    pub os: String,
    #[serde(rename = "$browser")]
    pub browser: String,
    #[serde(rename = "$device")]
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Presence {
    pub since: Option<u64>,
    pub game: Option<Activity>,
    pub status: String,
    pub afk: bool,
}

impl Default for Presence {
    fn default() -> Self {
        Self {
            since: None,
            game: None,
            status: "online".to_string(),
            afk: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Identify {
    pub token: String,
    pub properties: ConnectionProperties,
    pub compress: bool,
    pub large_threshold: u64,
    pub shard: [u64; 2],
    pub presence: Presence,
    pub guild_subscriptions: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VoiceStateUpdate {
    pub guild_id: String,
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RequestGuildMembers {
    pub guild_id: String,
    pub query: String,
    pub limit: u64,
}
