use serde::Deserialize;

use crate::common::SessionId;
use crate::protocol::{NodeEvent, NodeStats};

/// Frames pushed by a node over the control channel, decoded once at the
/// channel boundary so everything downstream is exhaustive over this union.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    /// First frame after the handshake.
    Ready {
        resumed: bool,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Periodic per-player state sync; also the acknowledgment that the
    /// node's voice connection for that room is up.
    PlayerUpdate {
        #[serde(rename = "guildId")]
        guild_id: SessionId,
        state: PlayerUpdateState,
    },
    Stats {
        #[serde(flatten)]
        stats: NodeStats,
    },
    Event {
        #[serde(flatten)]
        event: NodeEvent,
    },
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PlayerUpdateState {
    /// Unix timestamp (ms) the node sampled this state at.
    pub time: u64,
    #[serde(default)]
    pub position: Option<u64>,
    pub connected: bool,
    #[serde(default)]
    pub ping: Option<i64>,
}
