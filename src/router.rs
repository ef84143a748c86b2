use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::common::SessionId;
use crate::protocol::{NodeEvent, PlayerUpdateState};

/// Everything a session's listeners can observe.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Node(NodeEvent),
    PlayerUpdate(PlayerUpdateState),
}

/// Caller-registered event sink. Implementations must not assume they are
/// the only listener; panics are caught and logged, never propagated.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

/// Dispatches parsed node events to listeners, FIFO per session. Ordering
/// across sessions or nodes is not guaranteed; each session gets its own
/// queue and worker so a slow listener only ever delays its own session.
pub struct EventRouter {
    routes: DashMap<SessionId, SessionRoute>,
}

struct SessionRoute {
    tx: mpsc::UnboundedSender<SessionEvent>,
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    /// Registers a listener for one session, creating its dispatch queue on
    /// first use.
    pub fn subscribe(&self, session_id: SessionId, listener: Arc<dyn EventListener>) {
        let route = self
            .routes
            .entry(session_id.clone())
            .or_insert_with(|| Self::spawn_route(session_id));
        route.listeners.write().push(listener);
    }

    /// Queues an event for a session. Events for sessions nobody subscribed
    /// to are dropped.
    pub fn dispatch(&self, session_id: &SessionId, event: SessionEvent) {
        match self.routes.get(session_id) {
            Some(route) => {
                let _ = route.tx.send(event);
            }
            None => debug!("[{}] dropping event with no subscribers: {:?}", session_id, event),
        }
    }

    /// Tears down a session's queue and listeners. In-queue events are
    /// still delivered before the worker exits.
    pub fn remove_session(&self, session_id: &SessionId) {
        self.routes.remove(session_id);
    }

    fn spawn_route(session_id: SessionId) -> SessionRoute {
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
        let listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>> = Arc::new(RwLock::new(Vec::new()));

        let worker_listeners = listeners.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let snapshot: Vec<_> = worker_listeners.read().iter().cloned().collect();
                for listener in snapshot {
                    // One listener blowing up must not starve the others.
                    if catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                        warn!("[{}] event listener panicked; continuing", session_id);
                    }
                }
            }
        });

        SessionRoute { tx, listeners }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TrackEndReason;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl EventListener for Recorder {
        fn on_event(&self, event: &SessionEvent) {
            let tag = match event {
                SessionEvent::Node(NodeEvent::TrackStart { .. }) => "start",
                SessionEvent::Node(NodeEvent::TrackEnd { .. }) => "end",
                _ => "other",
            };
            self.seen.lock().push(tag.to_string());
        }
    }

    struct Exploder;

    impl EventListener for Exploder {
        fn on_event(&self, _: &SessionEvent) {
            panic!("listener bug");
        }
    }

    fn start(session: &str) -> SessionEvent {
        SessionEvent::Node(NodeEvent::TrackStart {
            guild_id: SessionId::from(session),
            track: "QAAA".into(),
        })
    }

    fn end(session: &str) -> SessionEvent {
        SessionEvent::Node(NodeEvent::TrackEnd {
            guild_id: SessionId::from(session),
            track: "QAAA".into(),
            reason: TrackEndReason::Finished,
        })
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within deadline");
    }

    #[tokio::test]
    async fn delivers_in_dispatch_order_per_session() {
        let router = EventRouter::new();
        let session = SessionId::from("1");
        let recorder = Recorder::new();
        router.subscribe(session.clone(), recorder.clone());

        // Same "network batch": both queued before the worker runs.
        router.dispatch(&session, start("1"));
        router.dispatch(&session, end("1"));

        wait_until(|| recorder.seen.lock().len() == 2).await;
        assert_eq!(*recorder.seen.lock(), vec!["start", "end"]);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_block_others() {
        let router = EventRouter::new();
        let session = SessionId::from("2");
        let recorder = Recorder::new();
        router.subscribe(session.clone(), Arc::new(Exploder));
        router.subscribe(session.clone(), recorder.clone());

        router.dispatch(&session, start("2"));
        router.dispatch(&session, end("2"));

        wait_until(|| recorder.seen.lock().len() == 2).await;
        assert_eq!(*recorder.seen.lock(), vec!["start", "end"]);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let router = EventRouter::new();
        let a = SessionId::from("a");
        let b = SessionId::from("b");
        let rec_a = Recorder::new();
        let rec_b = Recorder::new();
        router.subscribe(a.clone(), Arc::new(Exploder));
        router.subscribe(a.clone(), rec_a.clone());
        router.subscribe(b.clone(), rec_b.clone());

        router.dispatch(&a, start("a"));
        router.dispatch(&b, start("b"));

        wait_until(|| rec_a.seen.lock().len() == 1 && rec_b.seen.lock().len() == 1).await;
    }

    #[tokio::test]
    async fn dispatch_without_subscribers_is_a_no_op() {
        let router = EventRouter::new();
        router.dispatch(&SessionId::from("ghost"), start("ghost"));
    }
}
