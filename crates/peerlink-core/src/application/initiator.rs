//! Initiator role: joins an existing session, proposes a syn once the local
//! engine accepts the listener's config, then streams when the ack arrives.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::domain::media::StreamDirection;
use crate::domain::session::{SessionId, SessionState};
use crate::error::{FailureKind, HandshakeError, RelayError};

use super::machine::{spawn_push_task, Machine, RoleState, Status};
use super::ports::EngineControl;
use super::rendezvous::RendezvousClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    Idle,
    /// Checking the listener's config against the local engine.
    Configuring,
    SynSent,
    /// The listener acknowledged; [`InitiatorSession::stream`] is available.
    SynAcked,
    Streaming,
    Failed(FailureKind),
}

impl RoleState for InitiatorState {
    fn rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Configuring => 1,
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
        (state == SessionState::SynAcked).then_some(Self::SynAcked)
    }
}

/// One joining session. Dropping it cancels the session.
pub struct InitiatorSession {
    machine: Arc<Machine<InitiatorState>>,
    engine: Arc<dyn EngineControl>,
    rendezvous: RendezvousClient,
    tasks: TaskTracker,
}

impl InitiatorSession {
    pub(crate) fn new(
        engine: Arc<dyn EngineControl>,
        rendezvous: RendezvousClient,
        token: CancellationToken,
        tasks: TaskTracker,
    ) -> Self {
        let machine = Machine::spawn(InitiatorState::Idle, token, &tasks);
        Self {
            machine,
            engine,
            rendezvous,
            tasks,
        }
    }

    /// Validates the listener's config locally, then proposes a syn for
    /// `target` and follows its pushes.
    ///
    /// A config the engine rejects ends in `Failed(ConfigRejected)` before
    /// anything is written to the relay.
    pub async fn start(&self, target: SessionId) -> Result<(), HandshakeError> {
        let mut m = self.machine.lock().await;
        m.require(InitiatorState::Idle, "start")?;
        m.advance(InitiatorState::Configuring);

        let joined = async {
            let peer_config = self
                .machine
                .cancellable(self.rendezvous.fetch_peer_config(&target))
                .await?;
            let reply = self.engine.request_connect(Some(&peer_config)).await?;
            if !reply.is_valid {
                info!(session_id = %target, ?peer_config, "Engine rejected the listener's config");
                return Err(HandshakeError::ConfigRejected);
            }
            let connection = self
                .machine
                .cancellable(self.rendezvous.propose_syn(&target, reply.address))
                .await?;
            let subscription = self
                .machine
                .cancellable(self.rendezvous.subscribe(&connection.id))
                .await?;
            Ok((connection, subscription))
        }
        .await;
        let (connection, subscription) = m.check(joined)?;

        m.record(connection);
        m.advance(InitiatorState::SynSent);
        spawn_push_task(self.machine.clone(), subscription, &self.tasks);
        info!(session_id = %target, "Syn sent, waiting for ack");
        Ok(())
    }

    /// Resolves once the listener's ack has been observed, or with the
    /// failure that ended the session.
    pub async fn wait_until_actionable(&self) -> Result<(), HandshakeError> {
        let status = self
            .machine
            .wait_for(|state| *state == InitiatorState::SynAcked)
            .await;
        match status.state.failure() {
            Some(kind) => Err(HandshakeError::AlreadyFailed(kind)),
            None => Ok(()),
        }
    }

    /// Starts sending toward the listener's return address.
    ///
    /// Only valid once [`InitiatorState::SynAcked`] has been observed.
    pub async fn stream(&self) -> Result<(), HandshakeError> {
        let mut m = self.machine.lock().await;
        m.require(InitiatorState::SynAcked, "stream")?;
        let Some(connection) = m.connection().cloned() else {
            return m.check(Err(missing("no session record")));
        };
        let Some(return_address) = connection.return_address else {
            return m.check(Err(missing("ack snapshot has no return_address")));
        };

        let started = self
            .engine
            .start_stream(return_address, StreamDirection::Send, &connection.config)
            .await
            .map_err(HandshakeError::from);
        m.check(started)?;
        m.advance(InitiatorState::Streaming);
        info!(session_id = %connection.id, remote = %return_address, "Sending media");
        Ok(())
    }

    pub fn state(&self) -> InitiatorState {
        self.machine.current().state
    }

    pub fn status(&self) -> Status<InitiatorState> {
        self.machine.current()
    }

    pub fn watch(&self) -> watch::Receiver<Status<InitiatorState>> {
        self.machine.watch()
    }

    /// Abandons the handshake. A non-terminal session ends `Failed(Cancelled)`.
    pub fn cancel(&self) {
        self.machine.cancel();
    }
}

impl Drop for InitiatorSession {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::relay::memory::InMemoryRelay;
    use crate::application::ports::RelayCall;
    use crate::domain::session::SessionConnection;
    use crate::testing::{addr, config, EngineCall, ScriptedEngine};

    struct Harness {
        relay: Arc<InMemoryRelay>,
        engine: Arc<ScriptedEngine>,
        peer: RendezvousClient,
        tasks: TaskTracker,
        root: CancellationToken,
        id: SessionId,
    }

    impl Harness {
        /// A relay holding session "abc" created by a listener.
        async fn new(engine: ScriptedEngine) -> Self {
            let relay = Arc::new(InMemoryRelay::with_ids(["abc"]));
            let peer = RendezvousClient::new(relay.clone());
            let id = peer.create_session(&config()).await.unwrap().id;
            Self {
                relay,
                engine: Arc::new(engine),
                peer,
                tasks: TaskTracker::new(),
                root: CancellationToken::new(),
                id,
            }
        }

        fn initiator(&self) -> InitiatorSession {
            InitiatorSession::new(
                self.engine.clone(),
                RendezvousClient::new(self.relay.clone()),
                self.root.child_token(),
                self.tasks.clone(),
            )
        }
    }

    #[tokio::test]
    async fn streams_to_return_address_after_ack() {
        let h = Harness::new(ScriptedEngine::accepting("1.2.3.4:9000")).await;
        let initiator = h.initiator();

        initiator.start(h.id.clone()).await.unwrap();
        assert_eq!(initiator.state(), InitiatorState::SynSent);
        let stored = h.relay.session(&h.id).await.unwrap();
        assert_eq!(stored.send_address, Some(addr("1.2.3.4:9000")));

        h.peer.propose_ack(&h.id, addr("5.6.7.8:9100")).await.unwrap();
        initiator.wait_until_actionable().await.unwrap();
        initiator.stream().await.unwrap();

        assert_eq!(initiator.state(), InitiatorState::Streaming);
        assert_eq!(
            h.engine.calls(),
            vec![
                EngineCall::Connect(Some(config())),
                EngineCall::Stream {
                    remote: addr("5.6.7.8:9100"),
                    direction: StreamDirection::Send,
                    config: config(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn rejected_config_never_proposes_syn() {
        let h = Harness::new(ScriptedEngine::rejecting()).await;
        let initiator = h.initiator();

        let err = initiator.start(h.id.clone()).await.unwrap_err();
        assert!(matches!(err, HandshakeError::ConfigRejected));
        assert_eq!(
            initiator.state(),
            InitiatorState::Failed(FailureKind::ConfigRejected)
        );
        assert_eq!(h.relay.call_count(RelayCall::Syn).await, 0);
        assert_eq!(
            h.relay.session(&h.id).await.unwrap().state,
            SessionState::Listening
        );
    }

    #[tokio::test]
    async fn stream_before_ack_is_not_ready() {
        let h = Harness::new(ScriptedEngine::accepting("1.2.3.4:9000")).await;
        let initiator = h.initiator();
        initiator.start(h.id.clone()).await.unwrap();

        assert!(matches!(
            initiator.stream().await,
            Err(HandshakeError::NotReady { action: "stream", .. })
        ));
        assert_eq!(initiator.state(), InitiatorState::SynSent);
        assert!(h.engine.stream_calls().is_empty());
    }

    #[tokio::test]
    async fn stale_push_after_ack_is_discarded() {
        let h = Harness::new(ScriptedEngine::accepting("1.2.3.4:9000")).await;
        let initiator = h.initiator();
        initiator.start(h.id.clone()).await.unwrap();
        h.peer.propose_ack(&h.id, addr("5.6.7.8:9100")).await.unwrap();
        initiator.wait_until_actionable().await.unwrap();

        let stale = SessionConnection {
            id: h.id.clone(),
            state: SessionState::SynSent,
            return_address: None,
            send_address: Some(addr("1.2.3.4:9000")),
            config: config(),
        };
        h.relay.push_snapshot(stale).await;
        let current = h.relay.session(&h.id).await.unwrap();
        h.relay.push_snapshot(current).await;

        let mut rx = initiator.watch();
        rx.wait_for(|s| s.connection.as_ref().map(|c| c.state) == Some(SessionState::SynAcked))
            .await
            .unwrap();
        assert_eq!(initiator.state(), InitiatorState::SynAcked);
        initiator.stream().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_session_fails_with_relay_status() {
        let h = Harness::new(ScriptedEngine::accepting("1.2.3.4:9000")).await;
        let initiator = h.initiator();

        let err = initiator.start("missing".into()).await.unwrap_err();
        assert_eq!(err.kind(), Some(FailureKind::RelayRequestFailed(404)));
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test]
    async fn engine_unavailable_fails_start() {
        let h = Harness::new(ScriptedEngine::unavailable()).await;
        let initiator = h.initiator();

        initiator.start(h.id.clone()).await.unwrap_err();
        assert_eq!(
            initiator.state(),
            InitiatorState::Failed(FailureKind::ChannelUnavailable)
        );
    }

    #[tokio::test]
    async fn relay_close_before_ack_loses_session() {
        let h = Harness::new(ScriptedEngine::accepting("1.2.3.4:9000")).await;
        let initiator = h.initiator();
        initiator.start(h.id.clone()).await.unwrap();

        h.relay.close_subscriptions(&h.id).await;
        assert!(matches!(
            initiator.wait_until_actionable().await,
            Err(HandshakeError::AlreadyFailed(FailureKind::SessionLost))
        ));
    }

    #[tokio::test]
    async fn dropping_the_session_cancels_it() {
        let h = Harness::new(ScriptedEngine::accepting("1.2.3.4:9000")).await;
        let initiator = h.initiator();
        initiator.start(h.id.clone()).await.unwrap();
        let mut rx = initiator.watch();

        drop(initiator);
        let status = rx
            .wait_for(|s| s.state.is_terminal())
            .await
            .unwrap()
            .clone();
        assert_eq!(status.state, InitiatorState::Failed(FailureKind::Cancelled));
    }
}
