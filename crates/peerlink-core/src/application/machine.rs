//! Shared core of the listener and initiator handshake machines.
//!
//! A [`Machine`] owns one session's role state and local
//! [`SessionConnection`]. Every local transition and every pushed snapshot
//! goes through [`Machine::lock`], so a snapshot is never applied in the
//! middle of a transition. Each change is published on a `watch` channel.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::domain::session::{SessionConnection, SessionState, SnapshotOutcome};
use crate::error::{FailureKind, HandshakeError};

use super::ports::Subscription;

// ---------------------------------------------------------------------------
// Role states
// ---------------------------------------------------------------------------

/// A role's state enum. States are ranked; a machine only moves to a state
/// of higher rank, and never leaves a terminal state.
pub trait RoleState: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    fn rank(&self) -> u8;

    fn failed(kind: FailureKind) -> Self;

    fn failure(&self) -> Option<FailureKind>;

    fn is_terminal(&self) -> bool;

    /// The role state a pushed relay state moves this role to, if any.
    fn observed(state: SessionState) -> Option<Self>;
}

/// A role state together with the local copy of the session record.
#[derive(Debug, Clone, PartialEq)]
pub struct Status<S> {
    pub state: S,
    pub connection: Option<SessionConnection>,
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

pub(crate) struct Machine<S: RoleState> {
    status: Mutex<Status<S>>,
    published: watch::Sender<Status<S>>,
    token: CancellationToken,
}

impl<S: RoleState> Machine<S> {
    /// Creates a machine in `initial` and spawns the task that fails it with
    /// `Cancelled` once `token` fires.
    pub fn spawn(initial: S, token: CancellationToken, tasks: &TaskTracker) -> Arc<Self> {
        let status = Status {
            state: initial,
            connection: None,
        };
        let (published, _) = watch::channel(status.clone());
        let machine = Arc::new(Self {
            status: Mutex::new(status),
            published,
            token,
        });

        let sentinel = machine.clone();
        tasks.spawn(async move {
            sentinel.token.cancelled().await;
            sentinel.lock().await.fail(FailureKind::Cancelled);
        });
        machine
    }

    pub async fn lock(&self) -> MachineGuard<'_, S> {
        MachineGuard {
            status: self.status.lock().await,
            published: &self.published,
            token: &self.token,
        }
    }

    pub fn current(&self) -> Status<S> {
        self.published.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Status<S>> {
        self.published.subscribe()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolves with the first published status that satisfies `ready` or
    /// is terminal.
    pub async fn wait_for(&self, mut ready: impl FnMut(&S) -> bool) -> Status<S> {
        let mut rx = self.published.subscribe();
        let result = rx
            .wait_for(|status| ready(&status.state) || status.state.is_terminal())
            .await
            .map(|status| status.clone());
        // The sender lives as long as `self`, so the wait cannot fail.
        result.unwrap_or_else(|_| self.current())
    }

    /// Runs `fut` unless the session is cancelled first.
    pub async fn cancellable<T, E>(
        &self,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, HandshakeError>
    where
        E: Into<HandshakeError>,
    {
        tokio::select! {
            _ = self.token.cancelled() => Err(HandshakeError::Cancelled),
            result = fut => result.map_err(Into::into),
        }
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Exclusive access to a machine for the length of one transition.
pub(crate) struct MachineGuard<'a, S: RoleState> {
    status: MutexGuard<'a, Status<S>>,
    published: &'a watch::Sender<Status<S>>,
    token: &'a CancellationToken,
}

impl<S: RoleState> MachineGuard<'_, S> {
    pub fn state(&self) -> S {
        self.status.state
    }

    pub fn connection(&self) -> Option<&SessionConnection> {
        self.status.connection.as_ref()
    }

    /// Rejects an affordance unless the machine is in `expected`.
    pub fn require(&self, expected: S, action: &'static str) -> Result<(), HandshakeError> {
        let state = self.state();
        if state == expected {
            return Ok(());
        }
        Err(match state.failure() {
            Some(kind) => HandshakeError::AlreadyFailed(kind),
            None => HandshakeError::NotReady {
                action,
                state: format!("{state:?}"),
            },
        })
    }

    /// Moves to `next` if it ranks above the current state. Returns whether
    /// the state changed.
    pub fn advance(&mut self, next: S) -> bool {
        let current = self.state();
        if current.is_terminal() || next.rank() <= current.rank() {
            debug!(?current, ?next, "Ignoring non-forward transition");
            return false;
        }
        info!(from = ?current, to = ?next, "Handshake state changed");
        self.status.state = next;
        self.publish();
        true
    }

    /// Records a terminal failure. No-op once the machine is terminal.
    pub fn fail(&mut self, kind: FailureKind) {
        let current = self.state();
        if current.is_terminal() {
            return;
        }
        warn!(from = ?current, %kind, "Handshake failed");
        self.status.state = S::failed(kind);
        self.publish();
    }

    /// Fails the machine if `result` carries a fatal error, then hands the
    /// result back.
    pub fn check<T>(&mut self, result: Result<T, HandshakeError>) -> Result<T, HandshakeError> {
        if let Err(e) = &result {
            if let Some(kind) = e.kind() {
                self.fail(kind);
            }
        }
        result
    }

    /// Stores a record the relay returned for one of our own calls.
    pub fn record(&mut self, connection: SessionConnection) {
        self.apply(connection);
        self.publish();
    }

    /// Folds a pushed snapshot into the local record and advances the role
    /// if the snapshot shows the peer's step.
    pub fn observe(&mut self, snapshot: SessionConnection) {
        let pushed = snapshot.state;
        if self.apply(snapshot) != Some(SnapshotOutcome::Applied) {
            return;
        }
        if pushed == SessionState::Failed {
            self.fail(FailureKind::SessionLost);
        } else if let Some(next) = S::observed(pushed) {
            self.advance(next);
        }
        self.publish();
    }

    fn apply(&mut self, snapshot: SessionConnection) -> Option<SnapshotOutcome> {
        if self.status.connection.is_none() {
            self.status.connection = Some(snapshot);
            return Some(SnapshotOutcome::Applied);
        }
        let local = self.status.connection.as_mut()?;
        let (id, pushed) = (snapshot.id.clone(), snapshot.state);
        match local.apply_snapshot(snapshot) {
            Ok(SnapshotOutcome::Stale) => {
                warn!(session_id = %id, ?pushed, local = ?local.state, "Discarding stale snapshot");
                Some(SnapshotOutcome::Stale)
            }
            Ok(outcome) => {
                debug!(session_id = %id, ?pushed, ?outcome, "Snapshot applied");
                Some(outcome)
            }
            Err(rejection) => {
                warn!(session_id = %id, %rejection, "Discarding snapshot");
                None
            }
        }
    }

    fn publish(&mut self) {
        if self.status.state.is_terminal() {
            self.token.cancel();
        }
        self.published.send_replace(self.status.clone());
    }
}

// ---------------------------------------------------------------------------
// Push task
// ---------------------------------------------------------------------------

/// Feeds `subscription` into `machine` until the machine is terminal, the
/// session is cancelled, or the relay closes the push channel.
pub(crate) fn spawn_push_task<S: RoleState>(
    machine: Arc<Machine<S>>,
    mut subscription: Subscription,
    tasks: &TaskTracker,
) {
    tasks.spawn(async move {
        loop {
            tokio::select! {
                _ = machine.token().cancelled() => break,
                next = subscription.next() => {
                    let mut guard = machine.lock().await;
                    match next {
                        Some(snapshot) => guard.observe(snapshot),
                        None => {
                            info!(state = ?guard.state(), "Relay closed the push channel");
                            guard.fail(FailureKind::SessionLost);
                        }
                    }
                    if guard.state().is_terminal() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addr, config};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Toy {
        Waiting,
        Seen,
        Done,
        Failed(FailureKind),
    }

    impl RoleState for Toy {
        fn rank(&self) -> u8 {
            match self {
                Self::Waiting => 0,
                Self::Seen => 1,
                Self::Done => 2,
                Self::Failed(_) => 3,
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
            matches!(self, Self::Done | Self::Failed(_))
        }
        fn observed(state: SessionState) -> Option<Self> {
            (state == SessionState::SynSent).then_some(Self::Seen)
        }
    }

    fn snapshot(state: SessionState) -> SessionConnection {
        SessionConnection {
            id: "abc".into(),
            state,
            return_address: None,
            send_address: (state >= SessionState::SynSent).then(|| addr("1.2.3.4:9000")),
            config: config(),
        }
    }

    fn machine(tasks: &TaskTracker) -> Arc<Machine<Toy>> {
        Machine::spawn(Toy::Waiting, CancellationToken::new(), tasks)
    }

    #[tokio::test]
    async fn pushed_step_advances_and_stale_is_ignored() {
        let tasks = TaskTracker::new();
        let m = machine(&tasks);
        let mut guard = m.lock().await;
        guard.record(snapshot(SessionState::Listening));
        guard.observe(snapshot(SessionState::SynSent));
        assert_eq!(guard.state(), Toy::Seen);

        guard.observe(snapshot(SessionState::Listening));
        assert_eq!(guard.state(), Toy::Seen);
        assert_eq!(guard.connection().unwrap().state, SessionState::SynSent);
    }

    #[tokio::test]
    async fn terminal_state_is_final() {
        let tasks = TaskTracker::new();
        let m = machine(&tasks);
        let mut guard = m.lock().await;
        assert!(guard.advance(Toy::Done));
        guard.fail(FailureKind::SessionLost);
        assert!(!guard.advance(Toy::Seen));
        assert_eq!(guard.state(), Toy::Done);
        drop(guard);
        assert!(m.token().is_cancelled());
    }

    #[tokio::test]
    async fn require_distinguishes_not_ready_from_failed() {
        let tasks = TaskTracker::new();
        let m = machine(&tasks);
        let mut guard = m.lock().await;
        assert!(matches!(
            guard.require(Toy::Seen, "poke"),
            Err(HandshakeError::NotReady { action: "poke", .. })
        ));
        guard.fail(FailureKind::ConfigRejected);
        assert!(matches!(
            guard.require(Toy::Seen, "poke"),
            Err(HandshakeError::AlreadyFailed(FailureKind::ConfigRejected))
        ));
    }

    #[tokio::test]
    async fn cancellation_fails_a_live_machine() {
        let tasks = TaskTracker::new();
        let m = machine(&tasks);
        m.cancel();
        tasks.close();
        tasks.wait().await;
        assert_eq!(m.current().state, Toy::Failed(FailureKind::Cancelled));
    }

    #[tokio::test]
    async fn wait_for_resolves_on_terminal_state() {
        let tasks = TaskTracker::new();
        let m = machine(&tasks);
        let waiter = {
            let m = m.clone();
            tokio::spawn(async move { m.wait_for(|s| *s == Toy::Seen).await })
        };
        m.lock().await.fail(FailureKind::SessionLost);
        let status = waiter.await.unwrap();
        assert_eq!(status.state, Toy::Failed(FailureKind::SessionLost));
    }
}
