use crate::common::types::NodeId;

/// Everything that can go wrong in the engine, split the way callers need
/// to react: pool exhaustion and player-state misuse are returned
/// synchronously, transport trouble is absorbed by the reconnect loop until
/// a node goes dead, and per-request failures carry their cause.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No node in the pool is currently connected (after criteria filtering).
    /// Retrying, queueing, or surfacing this is the caller's decision.
    #[error("no available node in the pool")]
    NoAvailableNode,

    /// The node's control channel could not be reached or dropped mid-send.
    #[error("node `{0}` is unreachable")]
    NodeUnreachable(NodeId),

    /// A playback command was issued before the player's voice connection
    /// was ready. Never retried internally.
    #[error("player is not ready for playback commands")]
    PlayerNotReady,

    /// The command is not valid in the player's current state (e.g. `seek`
    /// while nothing is loaded).
    #[error("command not valid in player state `{state}`")]
    InvalidPlayerState { state: &'static str },

    /// The player was torn down while this command was in flight.
    #[error("player has been destroyed")]
    PlayerDestroyed,

    /// A correlated request saw no response before its deadline.
    #[error("request timed out after {0:?}")]
    RequestTimeout(std::time::Duration),

    /// The node answered a correlated request with an error payload.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// An encoded track blob could not be decoded.
    #[error("malformed track blob: {0}")]
    TrackDecode(String),

    /// A frame could not be (de)serialized.
    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// HTTP transport failure on the request channel.
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
