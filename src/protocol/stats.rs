use serde::{Deserialize, Serialize};

/// Periodic load report pushed by a node. The push interval is
/// node-controlled; this engine never polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    /// Node uptime in milliseconds.
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    /// Absent until the node has at least one playing player.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    /// Host-wide load fraction in [0, 1].
    pub system_load: f64,
    /// Load attributable to the node process, in [0, 1].
    pub lavalink_load: f64,
}

/// Frame counters per stats window; non-zero nulled/deficit values mean the
/// node is falling behind realtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FrameStats {
    pub sent: i32,
    pub nulled: i32,
    pub deficit: i32,
}
