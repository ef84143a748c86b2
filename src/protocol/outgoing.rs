use serde::Serialize;
use serde_json::Value;

use crate::common::SessionId;

/// Command frames sent to a node over the control channel.
///
/// Serialized in issue order per node; the `op` discriminator matches the
/// node wire contract.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OutgoingMessage {
    /// Forwards the platform's voice credentials so the node can open the
    /// media connection for this room.
    VoiceUpdate {
        #[serde(rename = "guildId")]
        guild_id: SessionId,
        #[serde(rename = "sessionId")]
        session_id: String,
        event: VoiceUpdateEvent,
    },
    Play {
        #[serde(rename = "guildId")]
        guild_id: SessionId,
        /// Encoded track blob. Opaque to this engine.
        track: String,
        #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        #[serde(rename = "endTime", skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<u16>,
        #[serde(rename = "noReplace", skip_serializing_if = "Option::is_none")]
        no_replace: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pause: Option<bool>,
    },
    Stop {
        #[serde(rename = "guildId")]
        guild_id: SessionId,
    },
    Pause {
        #[serde(rename = "guildId")]
        guild_id: SessionId,
        pause: bool,
    },
    Seek {
        #[serde(rename = "guildId")]
        guild_id: SessionId,
        position: u64,
    },
    Volume {
        #[serde(rename = "guildId")]
        guild_id: SessionId,
        volume: u16,
    },
    Filters {
        #[serde(rename = "guildId")]
        guild_id: SessionId,
        #[serde(flatten)]
        filters: Value,
    },
    Destroy {
        #[serde(rename = "guildId")]
        guild_id: SessionId,
    },
    ConfigureResuming {
        key: String,
        timeout: u64,
    },
}

/// The raw voice-server payload relayed inside a voiceUpdate command.
#[derive(Debug, Clone, Serialize)]
pub struct VoiceUpdateEvent {
    pub token: String,
    pub endpoint: String,
}

impl OutgoingMessage {
    /// The session a command targets, if it targets one at all.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::VoiceUpdate { guild_id, .. }
            | Self::Play { guild_id, .. }
            | Self::Stop { guild_id }
            | Self::Pause { guild_id, .. }
            | Self::Seek { guild_id, .. }
            | Self::Volume { guild_id, .. }
            | Self::Filters { guild_id, .. }
            | Self::Destroy { guild_id } => Some(guild_id),
            Self::ConfigureResuming { .. } => None,
        }
    }
}
