use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::common::{Error, NodeId, Result, SessionId, UserId};
use crate::config::{BackoffSettings, HealthSettings, NodeSettings, PoolSettings};
use crate::correlator::Correlator;
use crate::node::channel::NodeChannel;
use crate::node::{Node, NodeLifecycle, NodeState};
use crate::player::{PlayerHandle, PlayerSnapshot, ResyncDriver, VoiceConnector};
use crate::router::EventRouter;

/// Constraints a session puts on node selection. Empty criteria match
/// every node.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    /// Prefer a node serving this region; nodes without a region never
    /// match a regional request.
    pub region: Option<String>,
    /// Restrict to nodes that serve this shard. Nodes with no shard list
    /// accept any shard.
    pub shard: Option<u64>,
}

impl SelectionCriteria {
    pub fn region(region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            shard: None,
        }
    }
}

/// Pool-level notifications for the embedding application.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    NodeConnected {
        node: NodeId,
        reconnect: bool,
    },
    NodeDisconnected {
        node: NodeId,
    },
    NodeDead {
        node: NodeId,
    },
    /// The bound node's channel came back and the engine has replayed the
    /// session's state onto it (the node forgot its players). Informational;
    /// no caller action is required.
    SessionNeedsResync {
        session_id: SessionId,
    },
    /// The bound node is gone for good; the session needs a new node.
    /// Carries the last-known player state so migration works even if the
    /// player task already died with the node.
    SessionNeedsFailover {
        session_id: SessionId,
        state: PlayerSnapshot,
    },
}

struct Binding {
    node: NodeId,
    snapshot: PlayerSnapshot,
    /// Non-owning line into the session's player task, used to push a
    /// resync after its node reconnects. None for registry-only bindings.
    driver: Option<ResyncDriver>,
}

/// The registry of backend nodes and session-to-node bindings.
///
/// Owns one control-channel task per registered node and a pump task that
/// turns channel lifecycle transitions into [`PoolEvent`]s.
pub struct NodePool {
    user_id: UserId,
    health: HealthSettings,
    backoff: BackoffSettings,
    nodes: DashMap<NodeId, Arc<Node>>,
    bindings: DashMap<SessionId, Binding>,
    router: Arc<EventRouter>,
    correlator: Arc<Correlator>,
    seq: AtomicU64,
    lifecycle_tx: mpsc::UnboundedSender<NodeLifecycle>,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
}

impl NodePool {
    /// Builds an empty pool and its event stream. Nodes come in through
    /// [`register`](Self::register).
    pub fn new(settings: PoolSettings) -> (Arc<Self>, mpsc::UnboundedReceiver<PoolEvent>) {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(Self {
            user_id: settings.user_id,
            health: settings.health,
            backoff: settings.backoff,
            nodes: DashMap::new(),
            bindings: DashMap::new(),
            router: Arc::new(EventRouter::new()),
            correlator: Correlator::new(Duration::from_millis(settings.request_timeout_ms)),
            seq: AtomicU64::new(0),
            lifecycle_tx,
            events_tx,
        });

        tokio::spawn(Self::pump(Arc::downgrade(&pool), lifecycle_rx));

        (pool, events_rx)
    }

    /// Turns per-channel lifecycle transitions into pool events. Holds
    /// only a weak reference so dropping the pool stops the task.
    async fn pump(
        pool: std::sync::Weak<Self>,
        mut lifecycle_rx: mpsc::UnboundedReceiver<NodeLifecycle>,
    ) {
        while let Some(transition) = lifecycle_rx.recv().await {
            let Some(pool) = pool.upgrade() else { return };
            match transition {
                NodeLifecycle::Connected { node, reconnect } => {
                    if reconnect {
                        // The node lost its players with the old socket.
                        // Replay each bound session's state onto it here;
                        // the event only notifies.
                        for session_id in pool.sessions_on(&node) {
                            let replayed = pool
                                .bindings
                                .get(&session_id)
                                .and_then(|b| b.driver.as_ref().map(ResyncDriver::resync))
                                .unwrap_or(false);
                            if !replayed {
                                debug!("[{}] no live player task to resync", session_id);
                            }
                            pool.emit(PoolEvent::SessionNeedsResync { session_id });
                        }
                    }
                    pool.emit(PoolEvent::NodeConnected { node, reconnect });
                }
                NodeLifecycle::Disconnected { node } => {
                    pool.emit(PoolEvent::NodeDisconnected { node });
                }
                NodeLifecycle::Dead { node } => {
                    warn!("[{}] node exhausted its retries", node);
                    pool.evacuate(&node);
                    pool.emit(PoolEvent::NodeDead { node });
                }
            }
        }
    }

    /// Adds a node and starts its control channel. Labels are unique per
    /// pool.
    pub fn register(&self, settings: NodeSettings) -> Result<Arc<Node>> {
        if self.nodes.contains_key(&settings.label) {
            return Err(Error::Config(format!(
                "node {} is already registered",
                settings.label
            )));
        }

        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let (node, cmd_rx) = Node::new(
            settings,
            self.user_id,
            self.health.clone(),
            self.correlator.clone(),
            seq,
        )?;

        NodeChannel::spawn(
            node.clone(),
            cmd_rx,
            self.router.clone(),
            self.lifecycle_tx.clone(),
            self.backoff.clone(),
        );

        info!("[{}] node registered", node.label());
        self.nodes.insert(node.label().clone(), node.clone());
        Ok(node)
    }

    /// Removes a node, stops its channel, and flags its sessions for
    /// failover.
    pub fn deregister(&self, label: &NodeId) -> Result<()> {
        let Some((_, node)) = self.nodes.remove(label) else {
            return Err(Error::Config(format!("unknown node {}", label)));
        };
        node.shutdown();
        self.evacuate(label);
        info!("[{}] node deregistered", label);
        Ok(())
    }

    pub fn node(&self, label: &NodeId) -> Option<Arc<Node>> {
        self.nodes.get(label).map(|n| n.clone())
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.iter().map(|n| n.clone()).collect()
    }

    pub fn node_for_session(&self, session_id: &SessionId) -> Option<Arc<Node>> {
        let binding = self.bindings.get(session_id)?;
        self.node(&binding.node)
    }

    /// Picks the healthiest connected node matching the criteria.
    ///
    /// Ordering is penalty score, then bound-session count, then
    /// registration order, so repeated calls under identical load are
    /// deterministic.
    pub fn best_node(&self, criteria: &SelectionCriteria) -> Result<Arc<Node>> {
        self.nodes
            .iter()
            .filter(|n| n.is_available() && n.accepts(criteria))
            .map(|n| n.clone())
            .min_by(|a, b| Self::rank(a, b))
            .ok_or(Error::NoAvailableNode)
    }

    fn rank(a: &Arc<Node>, b: &Arc<Node>) -> Ordering {
        a.score()
            .partial_cmp(&b.score())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.session_count().cmp(&b.session_count()))
            .then_with(|| a.registration_seq().cmp(&b.registration_seq()))
    }

    /// Creates a session's player on the best matching node.
    pub fn create_player(
        self: &Arc<Self>,
        session_id: impl Into<SessionId>,
        connector: Arc<dyn VoiceConnector>,
        criteria: &SelectionCriteria,
    ) -> Result<PlayerHandle> {
        let session_id = session_id.into();
        let node = self.best_node(criteria)?;
        self.bind_session(session_id.clone(), node.clone());
        let (handle, driver) = crate::player::spawn(
            session_id,
            node,
            connector,
            self.router.clone(),
            Arc::downgrade(self),
        );
        if let Some(mut binding) = self.bindings.get_mut(handle.session_id()) {
            binding.driver = Some(driver);
        }
        Ok(handle)
    }

    /// Records a session-to-node binding.
    pub fn bind_session(&self, session_id: SessionId, node: Arc<Node>) {
        node.bind(session_id.clone());
        self.bindings.insert(
            session_id,
            Binding {
                node: node.label().clone(),
                snapshot: PlayerSnapshot::default(),
                driver: None,
            },
        );
    }

    /// Moves a session's binding to another node. The caller drives the
    /// player's own failover; this only keeps the registry consistent.
    pub fn rebind_session(&self, session_id: &SessionId, node: &Arc<Node>) {
        if let Some(mut binding) = self.bindings.get_mut(session_id) {
            binding.node = node.label().clone();
        }
    }

    /// Drops a session entirely. Called when its player is destroyed.
    pub(crate) fn release_session(&self, session_id: &SessionId) {
        if let Some((_, binding)) = self.bindings.remove(session_id) {
            if let Some(node) = self.node(&binding.node) {
                node.unbind(session_id);
            }
        }
    }

    /// Last-known player state for a session, kept fresh by its player
    /// task.
    pub(crate) fn update_snapshot(&self, session_id: &SessionId, snapshot: PlayerSnapshot) {
        if let Some(mut binding) = self.bindings.get_mut(session_id) {
            binding.snapshot = snapshot;
        }
    }

    pub fn snapshot(&self, session_id: &SessionId) -> Option<PlayerSnapshot> {
        self.bindings.get(session_id).map(|b| b.snapshot.clone())
    }

    /// Flags every session bound to an unhealthy node for failover. Useful
    /// after registering fresh capacity.
    pub fn rebalance(&self) {
        for binding in self.bindings.iter() {
            let healthy = self
                .node(&binding.node)
                .map(|n| n.state() == NodeState::Connected)
                .unwrap_or(false);
            if !healthy {
                self.emit(PoolEvent::SessionNeedsFailover {
                    session_id: binding.key().clone(),
                    state: binding.snapshot.clone(),
                });
            }
        }
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn session_count(&self) -> usize {
        self.bindings.len()
    }

    /// Stops every control channel. Registered nodes stay listed but no
    /// longer reconnect.
    pub fn shutdown(&self) {
        for node in self.nodes.iter() {
            node.shutdown();
        }
        debug!("pool shut down with {} nodes", self.nodes.len());
    }

    fn sessions_on(&self, label: &NodeId) -> Vec<SessionId> {
        self.bindings
            .iter()
            .filter(|b| &b.node == label)
            .map(|b| b.key().clone())
            .collect()
    }

    fn evacuate(&self, label: &NodeId) {
        for session_id in self.sessions_on(label) {
            let state = self.snapshot(&session_id).unwrap_or_default();
            self.emit(PoolEvent::SessionNeedsFailover { session_id, state });
        }
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ChannelId;
    use crate::player::{PlayOptions, Playback, PlayerPhase};
    use crate::protocol::{CpuStats, MemoryStats, NodeStats, OutgoingMessage, PlayerUpdateState};
    use crate::router::SessionEvent;
    use async_trait::async_trait;
    use std::time::Duration;

    fn settings() -> PoolSettings {
        PoolSettings {
            user_id: 1u64.into(),
            ..PoolSettings::default()
        }
    }

    fn node_settings(label: &str) -> NodeSettings {
        NodeSettings {
            label: label.into(),
            host: "127.0.0.1".into(),
            port: 2333,
            password: "youshallnotpass".into(),
            secure: false,
            region: None,
            shards: None,
        }
    }

    /// Inserts a node without a channel task so tests control its state.
    fn insert_idle(pool: &NodePool, settings: NodeSettings) -> Arc<Node> {
        insert_idle_with_frames(pool, settings).0
    }

    /// Like [`insert_idle`] but keeps the outbound frame stream so tests
    /// can observe what the pool's players send to the node.
    fn insert_idle_with_frames(
        pool: &NodePool,
        settings: NodeSettings,
    ) -> (Arc<Node>, mpsc::UnboundedReceiver<OutgoingMessage>) {
        let seq = pool.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let (node, cmd_rx) = Node::new(
            settings,
            pool.user_id,
            pool.health.clone(),
            pool.correlator.clone(),
            seq,
        )
        .unwrap();
        pool.nodes.insert(node.label().clone(), node.clone());
        (node, cmd_rx)
    }

    struct NoopConnector;

    #[async_trait]
    impl VoiceConnector for NoopConnector {
        async fn join(&self, _: &SessionId, _: ChannelId) -> Result<()> {
            Ok(())
        }

        async fn leave(&self, _: &SessionId, _: ChannelId) -> Result<()> {
            Ok(())
        }
    }

    fn stats(playing: u32) -> NodeStats {
        NodeStats {
            players: playing,
            playing_players: playing,
            uptime: 1_000,
            memory: MemoryStats {
                free: 256,
                used: 256,
                allocated: 512,
                reservable: 1_024,
            },
            cpu: CpuStats {
                cores: 4,
                system_load: 0.0,
                lavalink_load: 0.0,
            },
            frame_stats: None,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<PoolEvent>) -> PoolEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a pool event")
            .expect("pool event stream closed")
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<OutgoingMessage>) -> OutgoingMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("command channel closed")
    }

    async fn wait_for_phase(handle: &PlayerHandle, want: PlayerPhase) {
        for _ in 0..200 {
            if handle.phase().await.unwrap() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("player never reached {:?}", want);
    }

    #[tokio::test]
    async fn best_node_prefers_the_lowest_score() {
        let (pool, _events) = NodePool::new(settings());
        let busy = insert_idle(&pool, node_settings("busy"));
        let calm = insert_idle(&pool, node_settings("calm"));
        busy.set_state(NodeState::Connected);
        calm.set_state(NodeState::Connected);

        busy.health().on_stats(stats(40));
        calm.health().on_stats(stats(2));

        let picked = pool.best_node(&SelectionCriteria::default()).unwrap();
        assert_eq!(picked.label(), calm.label());
    }

    #[tokio::test]
    async fn ties_break_on_session_count_then_registration_order() {
        let (pool, _events) = NodePool::new(settings());
        let first = insert_idle(&pool, node_settings("first"));
        let second = insert_idle(&pool, node_settings("second"));
        first.set_state(NodeState::Connected);
        second.set_state(NodeState::Connected);

        // Identical scores: registration order wins.
        let picked = pool.best_node(&SelectionCriteria::default()).unwrap();
        assert_eq!(picked.label(), first.label());

        // Load the earlier node and the emptier one wins.
        first.bind(SessionId::from("a"));
        let picked = pool.best_node(&SelectionCriteria::default()).unwrap();
        assert_eq!(picked.label(), second.label());
    }

    #[tokio::test]
    async fn unavailable_nodes_are_never_selected() {
        let (pool, _events) = NodePool::new(settings());
        insert_idle(&pool, node_settings("down"));

        assert!(matches!(
            pool.best_node(&SelectionCriteria::default()),
            Err(Error::NoAvailableNode)
        ));
    }

    #[tokio::test]
    async fn region_and_shard_criteria_filter_candidates() {
        let (pool, _events) = NodePool::new(settings());
        let mut eu = node_settings("eu");
        eu.region = Some("rotterdam".into());
        eu.shards = Some(vec![0, 1]);
        let mut us = node_settings("us");
        us.region = Some("us-central".into());
        let eu = insert_idle(&pool, eu);
        let us = insert_idle(&pool, us);
        eu.set_state(NodeState::Connected);
        us.set_state(NodeState::Connected);

        let picked = pool.best_node(&SelectionCriteria::region("rotterdam")).unwrap();
        assert_eq!(picked.label(), eu.label());

        let mut criteria = SelectionCriteria::region("rotterdam");
        criteria.shard = Some(7);
        assert!(matches!(
            pool.best_node(&criteria),
            Err(Error::NoAvailableNode)
        ));
    }

    #[tokio::test]
    async fn duplicate_labels_are_rejected() {
        let (pool, _events) = NodePool::new(settings());
        insert_idle(&pool, node_settings("a"));
        assert!(matches!(
            pool.register(node_settings("a")),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn dead_node_flags_its_sessions_for_failover() {
        let (pool, mut events) = NodePool::new(settings());
        let node = insert_idle(&pool, node_settings("doomed"));
        node.set_state(NodeState::Connected);
        pool.bind_session(SessionId::from("guild-1"), node.clone());

        let snapshot = PlayerSnapshot {
            track: Some("QAAA".into()),
            position_ms: 31_000,
            ..PlayerSnapshot::default()
        };
        pool.update_snapshot(&SessionId::from("guild-1"), snapshot);

        pool.lifecycle_tx
            .send(NodeLifecycle::Dead {
                node: node.label().clone(),
            })
            .unwrap();

        let mut saw_failover = false;
        for _ in 0..2 {
            match next_event(&mut events).await {
                PoolEvent::SessionNeedsFailover { session_id, state } => {
                    assert_eq!(session_id, SessionId::from("guild-1"));
                    assert_eq!(state.track.as_deref(), Some("QAAA"));
                    assert_eq!(state.position_ms, 31_000);
                    saw_failover = true;
                }
                PoolEvent::NodeDead { node: label } => assert_eq!(&label, node.label()),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(saw_failover);
    }

    #[tokio::test]
    async fn reconnect_flags_bound_sessions_for_resync() {
        let (pool, mut events) = NodePool::new(settings());
        let node = insert_idle(&pool, node_settings("flappy"));
        node.set_state(NodeState::Connected);
        pool.bind_session(SessionId::from("guild-9"), node.clone());

        pool.lifecycle_tx
            .send(NodeLifecycle::Connected {
                node: node.label().clone(),
                reconnect: true,
            })
            .unwrap();

        let mut saw_resync = false;
        for _ in 0..2 {
            match next_event(&mut events).await {
                PoolEvent::SessionNeedsResync { session_id } => {
                    assert_eq!(session_id, SessionId::from("guild-9"));
                    saw_resync = true;
                }
                PoolEvent::NodeConnected { reconnect, .. } => assert!(reconnect),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(saw_resync);
    }

    #[tokio::test]
    async fn reconnect_replays_bound_player_state_onto_the_node() {
        let (pool, mut events) = NodePool::new(settings());
        let (node, mut frames) = insert_idle_with_frames(&pool, node_settings("flappy"));
        node.set_state(NodeState::Connected);

        let handle = pool
            .create_player("guild-2", Arc::new(NoopConnector), &SelectionCriteria::default())
            .unwrap();
        handle.connect(ChannelId(4)).await.unwrap();
        handle.on_voice_state_update("vs");
        handle.on_voice_server_update("tok", "ep");
        match next_frame(&mut frames).await {
            OutgoingMessage::VoiceUpdate { .. } => {}
            other => panic!("expected voiceUpdate, got {:?}", other),
        }
        pool.router().dispatch(
            handle.session_id(),
            SessionEvent::PlayerUpdate(PlayerUpdateState {
                time: 0,
                position: Some(0),
                connected: true,
                ping: Some(1),
            }),
        );
        wait_for_phase(&handle, PlayerPhase::Ready(Playback::Stopped)).await;
        handle.play(PlayOptions::new("QAAA")).await.unwrap();
        match next_frame(&mut frames).await {
            OutgoingMessage::Play { .. } => {}
            other => panic!("expected play, got {:?}", other),
        }

        // The channel reconnects; the node has forgotten its players.
        pool.lifecycle_tx
            .send(NodeLifecycle::Connected {
                node: node.label().clone(),
                reconnect: true,
            })
            .unwrap();

        // Voice state comes back without any caller involvement.
        match next_frame(&mut frames).await {
            OutgoingMessage::VoiceUpdate { .. } => {}
            other => panic!("expected voiceUpdate replay, got {:?}", other),
        }

        // The notification still goes out alongside the replay.
        let mut saw_resync = false;
        for _ in 0..2 {
            match next_event(&mut events).await {
                PoolEvent::SessionNeedsResync { session_id } => {
                    assert_eq!(session_id, SessionId::from("guild-2"));
                    saw_resync = true;
                }
                PoolEvent::NodeConnected { reconnect, .. } => assert!(reconnect),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(saw_resync);

        // The next ack releases the queued play at the old position.
        pool.router().dispatch(
            handle.session_id(),
            SessionEvent::PlayerUpdate(PlayerUpdateState {
                time: 0,
                position: Some(0),
                connected: true,
                ping: Some(1),
            }),
        );
        match next_frame(&mut frames).await {
            OutgoingMessage::Play { track, .. } => assert_eq!(track, "QAAA"),
            other => panic!("expected play replay, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rebalance_reports_sessions_stranded_on_unhealthy_nodes() {
        let (pool, mut events) = NodePool::new(settings());
        let healthy = insert_idle(&pool, node_settings("healthy"));
        let sick = insert_idle(&pool, node_settings("sick"));
        healthy.set_state(NodeState::Connected);
        sick.set_state(NodeState::Reconnecting);
        pool.bind_session(SessionId::from("ok"), healthy);
        pool.bind_session(SessionId::from("stranded"), sick);

        pool.rebalance();

        match next_event(&mut events).await {
            PoolEvent::SessionNeedsFailover { session_id, .. } => {
                assert_eq!(session_id, SessionId::from("stranded"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn deregister_evacuates_and_forgets_the_node() {
        let (pool, mut events) = NodePool::new(settings());
        let node = insert_idle(&pool, node_settings("retiring"));
        node.set_state(NodeState::Connected);
        pool.bind_session(SessionId::from("guild-5"), node.clone());

        pool.deregister(&"retiring".into()).unwrap();
        assert!(pool.node(&"retiring".into()).is_none());

        match next_event(&mut events).await {
            PoolEvent::SessionNeedsFailover { session_id, .. } => {
                assert_eq!(session_id, SessionId::from("guild-5"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
