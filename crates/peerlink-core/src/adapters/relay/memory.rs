//! In-process [`RelayTransport`]: keeps session records in memory and pushes
//! a full snapshot to every subscriber on each change. A subscriber that
//! falls behind skips straight to the newest snapshot.
//!
//! Used by tests and for loopback runs where both peers share a process.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::application::ports::{RelayCall, RelayTransport, Subscription};
use crate::domain::media::MediaConfig;
use crate::domain::session::{SessionConnection, SessionId, SessionState};
use crate::error::RelayError;

const SUBSCRIPTION_BUFFER: usize = 16;

#[derive(Deserialize)]
struct ConfigBody {
    id: SessionId,
}

#[derive(Deserialize)]
struct SynBody {
    id: SessionId,
    send_address: SocketAddr,
}

#[derive(Deserialize)]
struct AckBody {
    id: SessionId,
    return_address: SocketAddr,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionConnection>,
    subscribers: HashMap<SessionId, Vec<watch::Sender<SessionConnection>>>,
    next_ids: VecDeque<String>,
    failures: HashMap<RelayCall, u16>,
    calls: HashMap<RelayCall, usize>,
}

impl Inner {
    fn allocate_id(&mut self) -> SessionId {
        let id = self
            .next_ids
            .pop_front()
            .unwrap_or_else(|| format!("{:08x}", rand::thread_rng().gen::<u32>()));
        SessionId(id)
    }

    fn session_mut(
        &mut self,
        call: RelayCall,
        id: &SessionId,
    ) -> Result<&mut SessionConnection, RelayError> {
        self.sessions.get_mut(id).ok_or(RelayError::Status {
            call: call.name(),
            status: 404,
        })
    }

    fn broadcast(&mut self, snapshot: &SessionConnection) {
        if let Some(subscribers) = self.subscribers.get_mut(&snapshot.id) {
            subscribers.retain(|latest| {
                latest.send_replace(snapshot.clone());
                !latest.is_closed()
            });
        }
    }
}

/// Moves the newest snapshot into the subscriber's queue whenever there is
/// room. Ends once the relay drops `latest` or the subscription goes away.
async fn forward(
    mut latest: watch::Receiver<SessionConnection>,
    tx: mpsc::Sender<SessionConnection>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            changed = latest.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = latest.borrow_and_update().clone();
                tokio::select! {
                    _ = token.cancelled() => break,
                    sent = tx.send(snapshot) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Relay that lives entirely in memory.
#[derive(Default)]
pub struct InMemoryRelay {
    inner: Mutex<Inner>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out `ids`, in order, to the next `listen` calls before falling
    /// back to random ids.
    pub fn with_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        let inner = Inner {
            next_ids: ids.into_iter().map(str::to_owned).collect(),
            ..Inner::default()
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Makes the next `call` fail with `status`.
    pub async fn fail_next(&self, call: RelayCall, status: u16) {
        self.inner.lock().await.failures.insert(call, status);
    }

    /// How many times `call` was requested, including failed requests.
    pub async fn call_count(&self, call: RelayCall) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .get(&call)
            .copied()
            .unwrap_or(0)
    }

    pub async fn session(&self, id: &SessionId) -> Option<SessionConnection> {
        self.inner.lock().await.sessions.get(id).cloned()
    }

    /// Sends `snapshot` to the session's subscribers without touching the
    /// stored record.
    pub async fn push_snapshot(&self, snapshot: SessionConnection) {
        self.inner.lock().await.broadcast(&snapshot);
    }

    /// Closes every push channel open for `id`.
    pub async fn close_subscriptions(&self, id: &SessionId) {
        self.inner.lock().await.subscribers.remove(id);
    }

    async fn handle(
        &self,
        call: RelayCall,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, RelayError> {
        let mut inner = self.inner.lock().await;
        *inner.calls.entry(call).or_default() += 1;
        if let Some(status) = inner.failures.remove(&call) {
            return Err(RelayError::Status {
                call: call.name(),
                status,
            });
        }

        let snapshot = match call {
            RelayCall::Listen => {
                let config: MediaConfig = parse(call, body)?;
                let id = inner.allocate_id();
                let connection = SessionConnection {
                    id: id.clone(),
                    state: SessionState::Listening,
                    return_address: None,
                    send_address: None,
                    config,
                };
                inner.sessions.insert(id, connection.clone());
                connection
            }
            RelayCall::Config => {
                let ConfigBody { id } = parse(call, body)?;
                let config = inner.session_mut(call, &id)?.config.clone();
                return Ok(serde_json::json!({ "config": config }));
            }
            RelayCall::Syn => {
                let SynBody { id, send_address } = parse(call, body)?;
                let session = inner.session_mut(call, &id)?;
                if session.state != SessionState::Listening {
                    return Err(conflict(call));
                }
                session.state = SessionState::SynSent;
                session.send_address = Some(send_address);
                session.clone()
            }
            RelayCall::Ack => {
                let AckBody { id, return_address } = parse(call, body)?;
                let session = inner.session_mut(call, &id)?;
                if session.state != SessionState::SynSent {
                    return Err(conflict(call));
                }
                session.state = SessionState::SynAcked;
                session.return_address = Some(return_address);
                session.clone()
            }
        };

        if call != RelayCall::Listen {
            inner.broadcast(&snapshot);
        }
        serde_json::to_value(&snapshot).map_err(|e| RelayError::Unexpected {
            call: call.name(),
            reason: e.to_string(),
        })
    }
}

fn parse<T: DeserializeOwned>(call: RelayCall, body: serde_json::Value) -> Result<T, RelayError> {
    serde_json::from_value(body).map_err(|_| RelayError::Status {
        call: call.name(),
        status: 400,
    })
}

fn conflict(call: RelayCall) -> RelayError {
    RelayError::Status {
        call: call.name(),
        status: 409,
    }
}

#[async_trait]
impl RelayTransport for InMemoryRelay {
    async fn request(
        &self,
        call: RelayCall,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, RelayError> {
        let result = self.handle(call, body).await;
        debug!(call = call.name(), ok = result.is_ok(), "Relay request handled");
        result
    }

    /// The current record is delivered first, so a subscriber opened right
    /// after a mutation still observes it.
    async fn subscribe(&self, id: &SessionId) -> Result<Subscription, RelayError> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .sessions
            .get(id)
            .cloned()
            .ok_or(RelayError::Status {
                call: "subscribe",
                status: 404,
            })?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        // Fresh channel with spare capacity; cannot fail.
        let _ = tx.try_send(current.clone());
        let (latest_tx, latest_rx) = watch::channel(current);
        inner.subscribers.entry(id.clone()).or_default().push(latest_tx);

        let token = CancellationToken::new();
        tokio::spawn(forward(latest_rx, tx, token.clone()));
        Ok(Subscription::new(rx, token))
    }
}
