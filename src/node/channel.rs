use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::common::{Error, Result};
use crate::config::BackoffSettings;
use crate::node::backoff::Backoff;
use crate::node::{Node, NodeLifecycle, NodeState};
use crate::protocol::{IncomingMessage, OutgoingMessage};
use crate::router::{EventRouter, SessionEvent};

/// What a single WS connection's end means for the outer loop.
enum ChannelOutcome {
    /// Abnormal close or send/receive failure; schedule a retry.
    Retry,
    /// Cancelled or command source dropped; stop entirely.
    Shutdown,
}

/// The persistent control-channel task for one node. Owns the only
/// outbound connection to that node; all reads and writes happen
/// sequentially inside this task.
pub(crate) struct NodeChannel {
    node: Arc<Node>,
    router: Arc<EventRouter>,
    lifecycle: mpsc::UnboundedSender<NodeLifecycle>,
    backoff: BackoffSettings,
}

impl NodeChannel {
    pub(crate) fn spawn(
        node: Arc<Node>,
        cmd_rx: mpsc::UnboundedReceiver<OutgoingMessage>,
        router: Arc<EventRouter>,
        lifecycle: mpsc::UnboundedSender<NodeLifecycle>,
        backoff: BackoffSettings,
    ) -> tokio::task::JoinHandle<()> {
        let channel = Self {
            node,
            router,
            lifecycle,
            backoff,
        };
        tokio::spawn(channel.run(cmd_rx))
    }

    async fn run(self, mut cmd_rx: mpsc::UnboundedReceiver<OutgoingMessage>) {
        let mut backoff = Backoff::new(self.backoff.clone());
        let mut was_connected = false;

        loop {
            if self.node.cancel_token().is_cancelled() {
                self.node.set_state(NodeState::Disconnected);
                return;
            }

            self.node.set_state(if was_connected {
                NodeState::Reconnecting
            } else {
                NodeState::Connecting
            });

            let mut established = false;
            let outcome = self
                .connect_once(&mut cmd_rx, &mut established, was_connected)
                .await;

            if established {
                backoff.reset();
                was_connected = true;
                let _ = self.lifecycle.send(NodeLifecycle::Disconnected {
                    node: self.node.label().clone(),
                });
            }

            match outcome {
                Ok(ChannelOutcome::Shutdown) => {
                    self.node.set_state(NodeState::Disconnected);
                    return;
                }
                Ok(ChannelOutcome::Retry) => {}
                Err(e) => {
                    warn!("[{}] control channel error: {}", self.node.label(), e);
                }
            }

            let delay = if established {
                // The link was up, so this is a drop, not a connection
                // failure; redial after the base delay on a fresh curve.
                Duration::from_millis(self.backoff.base_ms)
            } else {
                // The attempt that just ended counts against the limit.
                let delay = backoff.next();
                if backoff.is_exhausted() {
                    warn!(
                        "[{}] giving up after repeated connection failures",
                        self.node.label()
                    );
                    self.node.set_state(NodeState::Dead);
                    let _ = self.lifecycle.send(NodeLifecycle::Dead {
                        node: self.node.label().clone(),
                    });
                    return;
                }
                delay
            };

            debug!("[{}] reconnecting in {:?}", self.node.label(), delay);
            tokio::select! {
                _ = self.node.cancel_token().cancelled() => {
                    self.node.set_state(NodeState::Disconnected);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connection lifetime: handshake, then interleaved command writes
    /// and frame reads until something ends it.
    async fn connect_once(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<OutgoingMessage>,
        established: &mut bool,
        reconnect: bool,
    ) -> Result<ChannelOutcome> {
        let url = self.node.settings().ws_uri();
        debug!("[{}] connecting control channel: {}", self.node.label(), url);

        let mut request = url
            .into_client_request()
            .map_err(|e| self.unreachable(&e))?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&self.node.settings().password)
                .map_err(|e| self.unreachable(&e))?,
        );
        headers.insert(
            "User-Id",
            HeaderValue::from_str(&self.node.user_id().to_string())
                .map_err(|e| self.unreachable(&e))?,
        );
        headers.insert(
            "Client-Name",
            HeaderValue::from_static(concat!("lavapool/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(
            "Resume-Key",
            HeaderValue::from_str(self.node.resume_key()).map_err(|e| self.unreachable(&e))?,
        );

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| self.unreachable(&e))?;
        let (mut write, mut read) = ws.split();

        // Connected at transport level. Stats from before the disconnect no
        // longer reflect the node, so scoring restarts at the baseline.
        *established = true;
        self.node.health.reset();
        self.node.set_state(NodeState::Connected);
        info!(
            "[{}] control channel {}",
            self.node.label(),
            if reconnect { "reconnected" } else { "connected" }
        );
        let _ = self.lifecycle.send(NodeLifecycle::Connected {
            node: self.node.label().clone(),
            reconnect,
        });

        let resume = OutgoingMessage::ConfigureResuming {
            key: self.node.resume_key().to_string(),
            timeout: 60,
        };
        if self.write_frame(&mut write, &resume).await.is_err() {
            return Ok(ChannelOutcome::Retry);
        }

        loop {
            tokio::select! {
                _ = self.node.cancel_token().cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(ChannelOutcome::Shutdown);
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        return Ok(ChannelOutcome::Shutdown);
                    };
                    if self.write_frame(&mut write, &cmd).await.is_err() {
                        return Ok(ChannelOutcome::Retry);
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame
                                .as_ref()
                                .map(|f| u16::from(f.code))
                                .unwrap_or(1000);
                            info!("[{}] control channel closed (code {})", self.node.label(), code);
                            return Ok(ChannelOutcome::Retry);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("[{}] read error: {}", self.node.label(), e);
                            return Ok(ChannelOutcome::Retry);
                        }
                        None => {
                            debug!("[{}] control channel stream ended", self.node.label());
                            return Ok(ChannelOutcome::Retry);
                        }
                    }
                }
            }
        }
    }

    async fn write_frame<S>(&self, write: &mut S, msg: &OutgoingMessage) -> Result<()>
    where
        S: futures::Sink<Message> + Unpin,
    {
        let json = serde_json::to_string(msg)?;
        write
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| Error::NodeUnreachable(self.node.label().clone()))
    }

    fn handle_frame(&self, text: &str) {
        let msg: IncomingMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("[{}] unparseable frame: {} - {}", self.node.label(), e, text);
                return;
            }
        };

        match msg {
            IncomingMessage::Ready { resumed, session_id } => {
                debug!(
                    "[{}] ready (resumed={}, session={})",
                    self.node.label(),
                    resumed,
                    session_id
                );
                self.node.set_remote_session(session_id);
            }
            IncomingMessage::Stats { stats } => {
                self.node.health.on_stats(stats);
            }
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                if let Some(ping) = state.ping {
                    self.node.set_ping_ms(ping);
                }
                self.router
                    .dispatch(&guild_id, SessionEvent::PlayerUpdate(state));
            }
            IncomingMessage::Event { event } => {
                let session = event.session_id().clone();
                self.router.dispatch(&session, SessionEvent::Node(event));
            }
        }
    }

    fn unreachable(&self, cause: &impl std::fmt::Display) -> Error {
        warn!("[{}] {}", self.node.label(), cause);
        Error::NodeUnreachable(self.node.label().clone())
    }
}
