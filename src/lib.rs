//! Client-side engine for pools of Lavalink-style audio backend nodes.
//!
//! A [`NodePool`] owns one persistent WebSocket control channel per
//! registered node, scores nodes by their reported health, and binds each
//! voice session to the best node at creation time. Sessions are driven
//! through a [`PlayerHandle`], whose state machine reconciles caller
//! commands, voice-gateway callbacks, and node events in arrival order.
//! When a node's channel dies for good the pool emits failover events
//! carrying the last-known player state so sessions can migrate.

pub mod common;
pub mod config;
pub mod correlator;
pub mod node;
pub mod player;
pub mod pool;
pub mod protocol;
pub mod router;

pub use common::{ChannelId, Error, NodeId, Result, SessionId, UserId, VoiceServerInfo};
pub use config::{BackoffSettings, Config, HealthSettings, NodeSettings, PoolSettings};
pub use node::{LoadResult, Node, NodeState, RestClient, SearchType};
pub use player::{PlayOptions, Playback, PlayerHandle, PlayerPhase, PlayerSnapshot, VoiceConnector};
pub use pool::{NodePool, PoolEvent, SelectionCriteria};
pub use protocol::{NodeEvent, Track, TrackEndReason, TrackInfo};
pub use router::{EventListener, EventRouter, SessionEvent};
