//! Listener role: creates a session, waits for a peer's syn, then
//! acknowledges it and starts receiving.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::domain::media::{MediaConfig, StreamDirection};
use crate::domain::session::{SessionId, SessionState};
use crate::error::{FailureKind, HandshakeError, RelayError};

use super::machine::{spawn_push_task, Machine, RoleState, Status};
use super::ports::EngineControl;
use super::rendezvous::RendezvousClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening,
    /// A peer proposed a syn; [`ListenerSession::acknowledge`] is available.
    SynSent,
    SynAcked,
    Streaming,
    Failed(FailureKind),
}

impl RoleState for ListenerState {
    fn rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Listening => 1,
            Self::SynSent => 2,
            Self::SynAcked => 3,
            Self::Streaming => 4,
            Self::Failed(_) => 5,
        }
    }

    fn failed(kind: FailureKind) -> Self {
        Self::Failed(kind)
    }

    fn failure(&self) -> Option<FailureKind> {
        match self {
            Self::Failed(kind) => Some(*kind),
            _ => None,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Streaming | Self::Failed(_))
    }

    fn observed(state: SessionState) -> Option<Self> {
        (state == SessionState::SynSent).then_some(Self::SynSent)
    }
}

/// One listening session. Dropping it cancels the session.
pub struct ListenerSession {
    machine: Arc<Machine<ListenerState>>,
    engine: Arc<dyn EngineControl>,
    rendezvous: RendezvousClient,
    tasks: TaskTracker,
}

impl ListenerSession {
    pub(crate) fn new(
        engine: Arc<dyn EngineControl>,
        rendezvous: RendezvousClient,
        token: CancellationToken,
        tasks: TaskTracker,
    ) -> Self {
        let machine = Machine::spawn(ListenerState::Idle, token, &tasks);
        Self {
            machine,
            engine,
            rendezvous,
            tasks,
        }
    }

    /// Creates the session on the relay and starts following its pushes.
    pub async fn start(&self, config: MediaConfig) -> Result<SessionId, HandshakeError> {
        let mut m = self.machine.lock().await;
        m.require(ListenerState::Idle, "start")?;

        let opened = async {
            let connection = self
                .machine
                .cancellable(self.rendezvous.create_session(&config))
                .await?;
            let subscription = self
                .machine
                .cancellable(self.rendezvous.subscribe(&connection.id))
                .await?;
            Ok::<_, HandshakeError>((connection, subscription))
        }
        .await;
        let (connection, subscription) = m.check(opened)?;

        let id = connection.id.clone();
        m.record(connection);
        m.advance(ListenerState::Listening);
        spawn_push_task(self.machine.clone(), subscription, &self.tasks);
        info!(session_id = %id, "Listening for a peer");
        Ok(id)
    }

    /// Resolves once a peer's syn has been observed, or with the failure
    /// that ended the session.
    pub async fn wait_until_actionable(&self) -> Result<(), HandshakeError> {
        let status = self
            .machine
            .wait_for(|state| *state == ListenerState::SynSent)
            .await;
        match status.state.failure() {
            Some(kind) => Err(HandshakeError::AlreadyFailed(kind)),
            None => Ok(()),
        }
    }

    /// Binds a local media endpoint, publishes it as the ack, and starts
    /// receiving from the initiator.
    ///
    /// Only valid once [`ListenerState::SynSent`] has been observed.
    pub async fn acknowledge(&self) -> Result<(), HandshakeError> {
        let mut m = self.machine.lock().await;
        m.require(ListenerState::SynSent, "acknowledge")?;
        let Some(connection) = m.connection().cloned() else {
            return m.check(Err(missing("no session record")));
        };
        let Some(send_address) = connection.send_address else {
            return m.check(Err(missing("syn snapshot has no send_address")));
        };

        let acked = async {
            let reply = self
                .engine
                .request_connect(Some(&connection.config))
                .await?;
            if !reply.is_valid {
                return Err(HandshakeError::ConfigRejected);
            }
            self.machine
                .cancellable(self.rendezvous.propose_ack(&connection.id, reply.address))
                .await
        }
        .await;
        let acked = m.check(acked)?;
        let config = acked.config.clone();
        m.record(acked);
        m.advance(ListenerState::SynAcked);

        let started = self
            .engine
            .start_stream(send_address, StreamDirection::Return, &config)
            .await
            .map_err(HandshakeError::from);
        m.check(started)?;
        m.advance(ListenerState::Streaming);
        info!(session_id = %connection.id, remote = %send_address, "Receiving media");
        Ok(())
    }

    pub fn state(&self) -> ListenerState {
        self.machine.current().state
    }

    pub fn status(&self) -> Status<ListenerState> {
        self.machine.current()
    }

    pub fn watch(&self) -> watch::Receiver<Status<ListenerState>> {
        self.machine.watch()
    }

    /// Abandons the handshake. A non-terminal session ends `Failed(Cancelled)`.
    pub fn cancel(&self) {
        self.machine.cancel();
    }
}

impl Drop for ListenerSession {
    fn drop(&mut self) {
        self.machine.cancel();
    }
}

fn missing(reason: &str) -> HandshakeError {
    HandshakeError::Relay(RelayError::Unexpected {
        call: "ack",
        reason: reason.to_owned(),
    })
}
