use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use crate::common::{Error, Result};

/// Matches asynchronous responses to their originating requests.
///
/// Each outgoing request registers a locally generated id and a deadline;
/// whoever receives the response resolves it by id. Resolution is
/// exactly-once: a second response for the same id, or one for an id that
/// already timed out, is dropped with a diagnostic and never disturbs
/// another pending request.
pub struct Correlator {
    pending: DashMap<Uuid, oneshot::Sender<Result<Value>>>,
    timeout: Duration,
}

/// An in-flight request. Await [`PendingRequest::wait`] for the outcome.
pub struct PendingRequest {
    id: Uuid,
    rx: oneshot::Receiver<Result<Value>>,
    correlator: Arc<Correlator>,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            timeout,
        })
    }

    /// Registers a new pending request and returns its handle.
    pub fn register(self: &Arc<Self>) -> PendingRequest {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        PendingRequest {
            id,
            rx,
            correlator: self.clone(),
        }
    }

    /// Resolves the request with a successful response payload.
    pub fn complete(&self, id: Uuid, response: Value) {
        self.resolve(id, Ok(response));
    }

    /// Resolves the request with the node-reported failure cause.
    pub fn fail(&self, id: Uuid, cause: impl Into<String>) {
        self.resolve(id, Err(Error::RequestFailed(cause.into())));
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn resolve(&self, id: Uuid, outcome: Result<Value>) {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                // The waiter may have gone away between removal and send;
                // nothing to do then.
                let _ = tx.send(outcome);
            }
            None => warn!("dropping response for unknown or already-resolved request {}", id),
        }
    }
}

impl PendingRequest {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits for the matching response, failing with `RequestTimeout` once
    /// the deadline passes. The pending entry is removed either way.
    pub async fn wait(self) -> Result<Value> {
        let timeout = self.correlator.timeout;
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::RequestFailed("correlator dropped".into())),
            Err(_) => {
                self.correlator.pending.remove(&self.id);
                Err(Error::RequestTimeout(timeout))
            }
        }
    }
}
