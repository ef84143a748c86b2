use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::common::{ChannelId, Error, Result, SessionId};
use crate::node::Node;
use crate::pool::NodePool;
use crate::protocol::NodeEvent;
use crate::router::{EventListener, EventRouter, SessionEvent};

pub mod state;

pub use state::{Effect, PlayOptions, Playback, PlayerMachine, PlayerPhase, PlayerSnapshot};

/// Seam to the platform's voice gateway. The engine decides when to join
/// or leave a channel; the embedding application performs it.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn join(&self, session_id: &SessionId, channel: ChannelId) -> Result<()>;
    async fn leave(&self, session_id: &SessionId, channel: ChannelId) -> Result<()>;
}

enum Command {
    Connect {
        channel: ChannelId,
        reply: oneshot::Sender<Result<()>>,
    },
    Play {
        opts: PlayOptions,
        reply: oneshot::Sender<Result<()>>,
    },
    Pause {
        reply: oneshot::Sender<Result<()>>,
    },
    Resume {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    Seek {
        position_ms: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    SetVolume {
        volume: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    SetFilter {
        label: String,
        value: serde_json::Value,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveFilter {
        label: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ClearFilters {
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    VoiceStateUpdate {
        voice_session_id: String,
    },
    VoiceServerUpdate {
        token: String,
        endpoint: String,
    },
    Event(SessionEvent),
    /// Re-bind to a replacement node and replay logical state onto it.
    Failover {
        node: Arc<Node>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Replay logical state onto the current node after its channel
    /// reconnected. The pool's pump sends this without a reply.
    Resync {
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Phase {
        reply: oneshot::Sender<PlayerPhase>,
    },
    Position {
        reply: oneshot::Sender<u64>,
    },
    Snapshot {
        reply: oneshot::Sender<PlayerSnapshot>,
    },
    Node {
        reply: oneshot::Sender<Arc<Node>>,
    },
}

/// Cloneable handle onto one session's player.
///
/// All mutation flows through the session's mailbox task, which applies it
/// to the state machine one input at a time. Interleavings between voice
/// callbacks, node events, and caller commands resolve in arrival order.
#[derive(Clone)]
pub struct PlayerHandle {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<Command>,
    router: Arc<EventRouter>,
}

impl PlayerHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Registers a listener for this session's node events, delivered FIFO.
    pub fn subscribe(&self, listener: Arc<dyn EventListener>) {
        self.router.subscribe(self.session_id.clone(), listener);
    }

    pub async fn connect(&self, channel: ChannelId) -> Result<()> {
        self.round_trip(|reply| Command::Connect { channel, reply })
            .await
    }

    pub async fn play(&self, opts: PlayOptions) -> Result<()> {
        self.round_trip(|reply| Command::Play { opts, reply }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.round_trip(|reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.round_trip(|reply| Command::Resume { reply }).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.round_trip(|reply| Command::Stop { reply }).await
    }

    pub async fn seek(&self, position_ms: u64) -> Result<()> {
        self.round_trip(|reply| Command::Seek { position_ms, reply })
            .await
    }

    pub async fn set_volume(&self, volume: u16) -> Result<()> {
        self.round_trip(|reply| Command::SetVolume { volume, reply })
            .await
    }

    pub async fn set_filter(
        &self,
        label: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<()> {
        let label = label.into();
        self.round_trip(|reply| Command::SetFilter {
            label,
            value,
            reply,
        })
        .await
    }

    pub async fn remove_filter(&self, label: impl Into<String>) -> Result<()> {
        let label = label.into();
        self.round_trip(|reply| Command::RemoveFilter { label, reply })
            .await
    }

    pub async fn clear_filters(&self) -> Result<()> {
        self.round_trip(|reply| Command::ClearFilters { reply })
            .await
    }

    /// Destroys the session: node-side player, voice channel, and the
    /// mailbox task itself.
    pub async fn disconnect(&self) -> Result<()> {
        self.round_trip(|reply| Command::Disconnect { reply }).await
    }

    /// Feed from the platform's voice-state callback. Fire and forget;
    /// ordering against other inputs is mailbox arrival order.
    pub fn on_voice_state_update(&self, voice_session_id: impl Into<String>) {
        let _ = self.tx.send(Command::VoiceStateUpdate {
            voice_session_id: voice_session_id.into(),
        });
    }

    /// Feed from the platform's voice-server callback.
    pub fn on_voice_server_update(&self, token: impl Into<String>, endpoint: impl Into<String>) {
        let _ = self.tx.send(Command::VoiceServerUpdate {
            token: token.into(),
            endpoint: endpoint.into(),
        });
    }

    pub async fn failover(&self, node: Arc<Node>) -> Result<()> {
        self.round_trip(|reply| Command::Failover { node, reply })
            .await
    }

    pub async fn resync(&self) -> Result<()> {
        self.round_trip(|reply| Command::Resync { reply: Some(reply) })
            .await
    }

    pub async fn phase(&self) -> Result<PlayerPhase> {
        self.query(|reply| Command::Phase { reply }).await
    }

    /// Extrapolated playback position in milliseconds.
    pub async fn position_ms(&self) -> Result<u64> {
        self.query(|reply| Command::Position { reply }).await
    }

    pub async fn snapshot(&self) -> Result<PlayerSnapshot> {
        self.query(|reply| Command::Snapshot { reply }).await
    }

    /// The node this session is currently bound to.
    pub async fn node(&self) -> Result<Arc<Node>> {
        self.query(|reply| Command::Node { reply }).await
    }

    async fn round_trip(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| Error::PlayerDestroyed)?;
        rx.await.map_err(|_| Error::PlayerDestroyed)?
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| Error::PlayerDestroyed)?;
        rx.await.map_err(|_| Error::PlayerDestroyed)
    }
}

/// Non-owning way for the pool to push a resync into a session's mailbox
/// when its node's channel comes back. Weak so a driver parked in the
/// pool's binding table never keeps a dead player task alive.
pub(crate) struct ResyncDriver {
    tx: mpsc::WeakUnboundedSender<Command>,
}

impl ResyncDriver {
    /// Queues a resync. Returns false when the player task is gone.
    pub(crate) fn resync(&self) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(Command::Resync { reply: None }).is_ok(),
            None => false,
        }
    }
}

/// Bridges the event router into the mailbox so node events serialize with
/// everything else.
struct MailboxListener {
    tx: mpsc::UnboundedSender<Command>,
}

impl EventListener for MailboxListener {
    fn on_event(&self, event: &SessionEvent) {
        let _ = self.tx.send(Command::Event(event.clone()));
    }
}

pub(crate) fn spawn(
    session_id: SessionId,
    node: Arc<Node>,
    connector: Arc<dyn VoiceConnector>,
    router: Arc<EventRouter>,
    pool: Weak<NodePool>,
) -> (PlayerHandle, ResyncDriver) {
    let (tx, rx) = mpsc::unbounded_channel();
    router.subscribe(
        session_id.clone(),
        Arc::new(MailboxListener { tx: tx.clone() }),
    );

    let actor = PlayerActor {
        session_id: session_id.clone(),
        machine: PlayerMachine::new(session_id.clone()),
        node,
        connector,
        router: router.clone(),
        pool,
    };
    tokio::spawn(actor.run(rx));

    let driver = ResyncDriver { tx: tx.downgrade() };
    (
        PlayerHandle {
            session_id,
            tx,
            router,
        },
        driver,
    )
}

struct PlayerActor {
    session_id: SessionId,
    machine: PlayerMachine,
    node: Arc<Node>,
    connector: Arc<dyn VoiceConnector>,
    router: Arc<EventRouter>,
    pool: Weak<NodePool>,
}

impl PlayerActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            if self.handle(cmd).await {
                break;
            }
        }
        // Either an explicit disconnect or every handle was dropped.
        if self.machine.phase() != PlayerPhase::Destroyed {
            let effects = self.machine.disconnect();
            if let Err(err) = self.apply(effects).await {
                debug!("[{}] teardown effect failed: {}", self.session_id, err);
            }
        }
        self.router.remove_session(&self.session_id);
        if let Some(pool) = self.pool.upgrade() {
            pool.release_session(&self.session_id);
        }
        debug!("[{}] player task exited", self.session_id);
    }

    /// Applies one mailbox input. Returns true when the actor should exit.
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect { channel, reply } => {
                let outcome = self.transition(|m| m.request_connect(channel)).await;
                let _ = reply.send(outcome);
            }
            Command::Play { opts, reply } => {
                let outcome = self.transition(|m| m.play(opts)).await;
                let _ = reply.send(outcome);
            }
            Command::Pause { reply } => {
                let outcome = self.transition(|m| m.pause()).await;
                let _ = reply.send(outcome);
            }
            Command::Resume { reply } => {
                let outcome = self.transition(|m| m.resume()).await;
                let _ = reply.send(outcome);
            }
            Command::Stop { reply } => {
                let outcome = self.transition(|m| m.stop()).await;
                let _ = reply.send(outcome);
            }
            Command::Seek { position_ms, reply } => {
                let outcome = self.transition(|m| m.seek(position_ms)).await;
                let _ = reply.send(outcome);
            }
            Command::SetVolume { volume, reply } => {
                let outcome = self.transition(|m| m.set_volume(volume)).await;
                let _ = reply.send(outcome);
            }
            Command::SetFilter {
                label,
                value,
                reply,
            } => {
                let outcome = self.transition(|m| m.set_filter(label, value)).await;
                let _ = reply.send(outcome);
            }
            Command::RemoveFilter { label, reply } => {
                let outcome = self.transition(|m| m.remove_filter(&label)).await;
                let _ = reply.send(outcome);
            }
            Command::ClearFilters { reply } => {
                let outcome = self.transition(|m| m.clear_filters()).await;
                let _ = reply.send(outcome);
            }
            Command::Disconnect { reply } => {
                let effects = self.machine.disconnect();
                let _ = reply.send(self.apply(effects).await);
                return true;
            }
            Command::VoiceStateUpdate { voice_session_id } => {
                let effects = self.machine.on_voice_state_update(voice_session_id);
                self.apply_logged(effects).await;
            }
            Command::VoiceServerUpdate { token, endpoint } => {
                let effects = self.machine.on_voice_server_update(token, endpoint);
                self.apply_logged(effects).await;
            }
            Command::Event(event) => self.on_event(event).await,
            Command::Failover { node, reply } => {
                debug!(
                    "[{}] failing over from node {} to {}",
                    self.session_id,
                    self.node.label(),
                    node.label()
                );
                self.node.unbind(&self.session_id);
                node.bind(self.session_id.clone());
                self.node = node;
                let effects = self.machine.resync();
                let _ = reply.send(self.apply(effects).await);
                self.publish_snapshot();
            }
            Command::Resync { reply } => {
                let effects = self.machine.resync();
                let outcome = self.apply(effects).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(outcome);
                    }
                    None => {
                        if let Err(err) = outcome {
                            warn!("[{}] resync failed: {}", self.session_id, err);
                        }
                    }
                }
                self.publish_snapshot();
            }
            Command::Phase { reply } => {
                let _ = reply.send(self.machine.phase());
            }
            Command::Position { reply } => {
                let _ = reply.send(self.machine.position_ms());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.machine.snapshot());
            }
            Command::Node { reply } => {
                let _ = reply.send(self.node.clone());
            }
        }
        false
    }

    async fn on_event(&mut self, event: SessionEvent) {
        let effects = match event {
            SessionEvent::PlayerUpdate(state) => self.machine.on_player_update(state),
            SessionEvent::Node(NodeEvent::TrackStart { track, .. }) => {
                self.machine.on_track_start(track)
            }
            SessionEvent::Node(NodeEvent::TrackEnd { reason, .. }) => {
                self.machine.on_track_end(reason)
            }
            SessionEvent::Node(NodeEvent::TrackException {
                track, exception, ..
            }) => {
                // A terminal TrackEnd(loadFailed) follows from the node.
                warn!(
                    "[{}] track {} raised {:?}: {}",
                    self.session_id, track, exception.severity, exception.cause
                );
                Vec::new()
            }
            SessionEvent::Node(NodeEvent::TrackStuck {
                track,
                threshold_ms,
                ..
            }) => {
                warn!(
                    "[{}] track {} stuck for over {}ms",
                    self.session_id, track, threshold_ms
                );
                Vec::new()
            }
            SessionEvent::Node(NodeEvent::WebSocketClosed { code, reason, .. }) => {
                // The node's own voice link dropped. Fresh credentials from
                // the platform will arrive through the usual callbacks.
                warn!(
                    "[{}] node voice socket closed: {} {}",
                    self.session_id, code, reason
                );
                Vec::new()
            }
        };
        self.apply_logged(effects).await;
        self.publish_snapshot();
    }

    async fn transition(
        &mut self,
        f: impl FnOnce(&mut PlayerMachine) -> Result<Vec<Effect>>,
    ) -> Result<()> {
        let effects = f(&mut self.machine)?;
        let outcome = self.apply(effects).await;
        self.publish_snapshot();
        outcome
    }

    async fn apply(&mut self, effects: Vec<Effect>) -> Result<()> {
        for effect in effects {
            match effect {
                Effect::Send(msg) => self.node.send(msg)?,
                Effect::JoinChannel(channel) => {
                    self.connector.join(&self.session_id, channel).await?
                }
                Effect::LeaveChannel(channel) => {
                    self.connector.leave(&self.session_id, channel).await?
                }
            }
        }
        Ok(())
    }

    /// Like [`apply`](Self::apply) for inputs that have no caller waiting
    /// on the outcome.
    async fn apply_logged(&mut self, effects: Vec<Effect>) {
        if let Err(err) = self.apply(effects).await {
            warn!("[{}] deferred effect failed: {}", self.session_id, err);
        }
    }

    /// Keeps the pool's last-known state current so a failover event can
    /// carry it even if this task is already gone.
    fn publish_snapshot(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.update_snapshot(&self.session_id, self.machine.snapshot());
        }
    }
}
