//! Process-wide session context.
//!
//! Owns the single engine handle, the relay client, and the cancellation
//! scope every session and push task runs under. Created once at startup;
//! [`SessionContext::shutdown`] cancels every live session, waits for their
//! tasks, and releases the engine channel.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use super::initiator::InitiatorSession;
use super::listener::ListenerSession;
use super::ports::{EngineControl, RelayTransport};
use super::rendezvous::RendezvousClient;

pub struct SessionContext {
    engine: Arc<dyn EngineControl>,
    rendezvous: RendezvousClient,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl SessionContext {
    pub fn new(engine: Arc<dyn EngineControl>, relay: Arc<dyn RelayTransport>) -> Self {
        Self {
            engine,
            rendezvous: RendezvousClient::new(relay),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn EngineControl> {
        &self.engine
    }

    pub fn rendezvous(&self) -> &RendezvousClient {
        &self.rendezvous
    }

    pub fn listener(&self) -> ListenerSession {
        ListenerSession::new(
            self.engine.clone(),
            self.rendezvous.clone(),
            self.cancel.child_token(),
            self.tasks.clone(),
        )
    }

    pub fn initiator(&self) -> InitiatorSession {
        InitiatorSession::new(
            self.engine.clone(),
            self.rendezvous.clone(),
            self.cancel.child_token(),
            self.tasks.clone(),
        )
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancels every session, waits for their tasks, then closes the engine
    /// channel. Sessions created afterwards start out cancelled.
    pub async fn shutdown(&self) {
        info!(tasks = self.tasks.len(), "Shutting down session context");
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.engine.close().await;
    }
}
