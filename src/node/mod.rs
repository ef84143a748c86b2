use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::{Error, NodeId, Result, SessionId, UserId};
use crate::config::{HealthSettings, NodeSettings};
use crate::correlator::Correlator;
use crate::protocol::OutgoingMessage;

pub mod backoff;
pub mod channel;
pub mod health;
pub mod rest;

pub use health::HealthTracker;
pub use rest::{LoadResult, RestClient, SearchType};

/// Transport state of a node's control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retries exhausted. The node stays dead until explicitly
    /// re-registered.
    Dead,
}

impl NodeState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Channel lifecycle notifications consumed by the pool.
#[derive(Debug, Clone)]
pub enum NodeLifecycle {
    Connected { node: NodeId, reconnect: bool },
    Disconnected { node: NodeId },
    Dead { node: NodeId },
}

/// One configured backend node: identity, transport state, health, and the
/// set of sessions currently bound to it. Owned by the pool; the control
/// channel task holds an `Arc` for its lifetime.
pub struct Node {
    settings: NodeSettings,
    user_id: UserId,
    resume_key: String,
    state: RwLock<NodeState>,
    health: HealthTracker,
    sessions: DashSet<SessionId>,
    /// Registration order, for stable selection tie-breaks.
    seq: u64,
    cmd_tx: mpsc::UnboundedSender<OutgoingMessage>,
    cancel: CancellationToken,
    rest: RestClient,
    /// Session id the node assigned in its ready frame.
    remote_session: Mutex<Option<String>>,
    /// Last observed control-channel latency hint, ms (-1 until known).
    ping: AtomicI64,
}

impl Node {
    pub(crate) fn new(
        settings: NodeSettings,
        user_id: UserId,
        health: HealthSettings,
        correlator: Arc<Correlator>,
        seq: u64,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<OutgoingMessage>)> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let rest = RestClient::new(&settings, correlator)?;

        let node = Arc::new(Self {
            user_id,
            resume_key: Uuid::new_v4().simple().to_string(),
            state: RwLock::new(NodeState::Disconnected),
            health: HealthTracker::new(health),
            sessions: DashSet::new(),
            seq,
            cmd_tx,
            cancel: CancellationToken::new(),
            rest,
            remote_session: Mutex::new(None),
            ping: AtomicI64::new(-1),
            settings,
        });

        Ok((node, cmd_rx))
    }

    pub fn label(&self) -> &NodeId {
        &self.settings.label
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub(crate) fn user_id(&self) -> UserId {
        self.user_id
    }

    pub(crate) fn resume_key(&self) -> &str {
        &self.resume_key
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        *self.state.write() = state;
    }

    pub fn is_available(&self) -> bool {
        self.state() == NodeState::Connected
    }

    /// Current penalty score; lower is preferred.
    pub fn score(&self) -> f64 {
        self.health.score()
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn ping_ms(&self) -> i64 {
        self.ping.load(Ordering::Relaxed)
    }

    pub(crate) fn set_ping_ms(&self, ping: i64) {
        self.ping.store(ping, Ordering::Relaxed);
    }

    pub(crate) fn set_remote_session(&self, id: String) {
        *self.remote_session.lock() = Some(id);
    }

    pub fn remote_session(&self) -> Option<String> {
        self.remote_session.lock().clone()
    }

    /// Queues a command frame for the control channel. Frames are written
    /// in issue order; while the channel is between connections they sit in
    /// the queue and flush on reconnect.
    pub fn send(&self, msg: OutgoingMessage) -> Result<()> {
        if self.state() == NodeState::Dead {
            return Err(Error::NodeUnreachable(self.settings.label.clone()));
        }
        self.cmd_tx
            .send(msg)
            .map_err(|_| Error::NodeUnreachable(self.settings.label.clone()))
    }

    pub(crate) fn bind(&self, session: SessionId) {
        self.sessions.insert(session);
    }

    pub(crate) fn unbind(&self, session: &SessionId) {
        self.sessions.remove(session);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn bound_sessions(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.clone()).collect()
    }

    pub(crate) fn registration_seq(&self) -> u64 {
        self.seq
    }

    /// Matches this node against selection criteria.
    pub(crate) fn accepts(&self, criteria: &crate::pool::SelectionCriteria) -> bool {
        if let Some(region) = &criteria.region {
            if self.settings.region.as_deref() != Some(region.as_str()) {
                return false;
            }
        }
        if let (Some(shard), Some(shards)) = (criteria.shard, &self.settings.shards) {
            if !shards.contains(&shard) {
                return false;
            }
        }
        true
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stops the control channel task. Irreversible for this instance.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
        self.set_state(NodeState::Disconnected);
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("label", &self.settings.label)
            .field("state", &self.state())
            .field("score", &self.score())
            .field("sessions", &self.session_count())
            .finish()
    }
}
