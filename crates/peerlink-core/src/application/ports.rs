//! Port traits (interfaces) that use cases depend on.
//!
//! Adapters implement these traits; use cases never reference Unix sockets,
//! reqwest, or WebSockets.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::domain::control::{ConnectReply, ControlFrame};
use crate::domain::media::{DeviceCatalog, MediaConfig, StreamDirection};
use crate::domain::session::{SessionConnection, SessionId};
use crate::error::{ChannelError, RelayError};

// ---------------------------------------------------------------------------
// EngineControl (local media engine)
// ---------------------------------------------------------------------------

/// Command/response access to the local media engine.
///
/// Implementations serialize commands: one in flight at a time, replies
/// matched 1:1.
#[async_trait]
pub trait EngineControl: Send + Sync {
    /// Ask the engine for its host → device → capability catalog.
    async fn request_catalog(&self) -> Result<DeviceCatalog, ChannelError>;

    /// Have the engine validate `config` and bind a local media endpoint.
    async fn request_connect(
        &self,
        config: Option<&MediaConfig>,
    ) -> Result<ConnectReply, ChannelError>;

    /// Start streaming toward `remote`. Fire-and-forget: no reply is awaited.
    async fn start_stream(
        &self,
        remote: SocketAddr,
        direction: StreamDirection,
        config: &MediaConfig,
    ) -> Result<(), ChannelError>;

    /// Release the channel. Later commands fail with [`ChannelError::Closed`].
    async fn close(&self);
}

// ---------------------------------------------------------------------------
// ControlCodec (serialization)
// ---------------------------------------------------------------------------

/// Encodes / decodes control-plane payloads (e.g. JSON, CBOR).
///
/// Framing is separate; a codec only sees the payload bytes of one frame.
pub trait ControlCodec: Send + Sync {
    fn encode(&self, frame: &ControlFrame) -> Result<Vec<u8>, ChannelError>;
    fn decode_frame(&self, data: &[u8]) -> Result<ControlFrame, ChannelError>;
    fn decode_catalog(&self, data: &[u8]) -> Result<DeviceCatalog, ChannelError>;
    fn decode_connect(&self, data: &[u8]) -> Result<ConnectReply, ChannelError>;
}

// ---------------------------------------------------------------------------
// RelayTransport (rendezvous relay)
// ---------------------------------------------------------------------------

/// The relay's request/response calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayCall {
    Listen,
    Config,
    Syn,
    Ack,
}

impl RelayCall {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Listen => "listen",
            Self::Config => "config",
            Self::Syn => "syn",
            Self::Ack => "ack",
        }
    }

    /// HTTP path of the call on the relay.
    pub fn path(&self) -> &'static str {
        match self {
            Self::Listen => "/api/listen/",
            Self::Config => "/api/config/",
            Self::Syn => "/api/syn/",
            Self::Ack => "/api/ack/",
        }
    }
}

/// Abstracts the relay service: structured request/response plus one push
/// subscription per session.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Perform one call. Non-success statuses map to [`RelayError::Status`].
    async fn request(
        &self,
        call: RelayCall,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, RelayError>;

    /// Open the push stream of full snapshots for `id`.
    ///
    /// The first snapshot delivered must be the session's current record.
    /// The handshake machines subscribe only after their own relay call, and
    /// a peer step landing in between is otherwise never observed. A relay
    /// whose push endpoint does not send the record on connect breaks this.
    async fn subscribe(&self, id: &SessionId) -> Result<Subscription, RelayError>;
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A stream of pushed [`SessionConnection`] snapshots.
///
/// Ends (`next` returns `None`) when the relay closes the push channel.
/// Dropping the subscription stops the task feeding it.
pub struct Subscription {
    snapshots: mpsc::Receiver<SessionConnection>,
    _feeder: Option<DropGuard>,
}

impl Subscription {
    /// Wraps a receiver fed by a task that watches `feeder`.
    pub fn new(snapshots: mpsc::Receiver<SessionConnection>, feeder: CancellationToken) -> Self {
        Self {
            snapshots,
            _feeder: Some(feeder.drop_guard()),
        }
    }

    /// Wraps a receiver whose senders are owned elsewhere.
    pub fn from_receiver(snapshots: mpsc::Receiver<SessionConnection>) -> Self {
        Self {
            snapshots,
            _feeder: None,
        }
    }

    pub async fn next(&mut self) -> Option<SessionConnection> {
        self.snapshots.recv().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
