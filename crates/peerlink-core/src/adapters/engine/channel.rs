//! Framed command channel to the local media engine.
//!
//! One command is in flight at a time: callers queue on the channel lock in
//! FIFO order, and each reply is read before the lock is released. A caller
//! that gives up mid-exchange does not disturb the channel. Any I/O, framing,
//! decoding or timeout failure poisons it; later commands fail with
//! [`ChannelError::Closed`] and a new channel must be connected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::application::ports::{ControlCodec, EngineControl};
use crate::domain::control::{ConnectReply, ControlFrame};
use crate::domain::media::{DeviceCatalog, MediaConfig, StreamDirection};
use crate::error::ChannelError;

use super::codec::CodecKind;
use super::framing::Framing;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub framing: Framing,
    pub codec: CodecKind,
    /// Upper bound on waiting for any single reply.
    pub response_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            codec: CodecKind::default(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineChannel
// ---------------------------------------------------------------------------

/// [`EngineControl`] over any byte stream (a Unix socket in production).
pub struct EngineChannel<S> {
    stream: Arc<Mutex<Option<S>>>,
    framing: Framing,
    codec: Box<dyn ControlCodec>,
    response_timeout: Duration,
}

impl<S> EngineChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, options: &ChannelOptions) -> Self {
        Self {
            stream: Arc::new(Mutex::new(Some(stream))),
            framing: options.framing,
            codec: options.codec.build(),
            response_timeout: options.response_timeout,
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.stream.lock().await.is_none()
    }

    /// Sends `frame` and, if the command has one, reads its reply.
    ///
    /// The frame is encoded and size-checked before the lock is taken, so a
    /// refused frame leaves the channel usable. Once the lock is held the
    /// exchange runs on its own task: a caller that stops waiting leaves the
    /// stream in step for the next command.
    async fn transact(&self, frame: &ControlFrame) -> Result<Option<Bytes>, ChannelError> {
        let command = frame.command();
        let payload = self.codec.encode(frame)?;
        let wire = self.framing.encode(command, &payload)?;
        let expects_reply = frame.expects_reply();

        let mut slot = self.stream.clone().lock_owned().await;
        if slot.is_none() {
            return Err(ChannelError::Closed);
        }
        debug!(command, len = payload.len(), "Sending engine command");

        let framing = self.framing;
        let response_timeout = self.response_timeout;
        let exchange = tokio::spawn(async move {
            let stream = slot.as_mut().ok_or(ChannelError::Closed)?;
            let result = async {
                stream.write_all(&wire).await?;
                stream.flush().await?;
                if !expects_reply {
                    return Ok::<_, ChannelError>(None);
                }
                let read = framing.read_frame(&mut *stream);
                match tokio::time::timeout(response_timeout, read).await {
                    Ok(reply) => reply.map(Some),
                    Err(_) => Err(ChannelError::Timeout(response_timeout)),
                }
            }
            .await;

            match &result {
                Ok(Some(reply)) => debug!(command, len = reply.len(), "Engine replied"),
                Ok(None) => {}
                Err(e) => {
                    warn!(command, error = %e, "Engine channel poisoned");
                    slot.take();
                }
            }
            result
        });

        exchange.await.map_err(|e| {
            warn!(command, error = %e, "Engine exchange task failed");
            ChannelError::Closed
        })?
    }

    async fn request<T>(
        &self,
        frame: &ControlFrame,
        decode: impl FnOnce(&dyn ControlCodec, &[u8]) -> Result<T, ChannelError>,
    ) -> Result<T, ChannelError> {
        let reply = self
            .transact(frame)
            .await?
            .ok_or(ChannelError::UnexpectedEof)?;
        match decode(self.codec.as_ref(), &reply) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(command = frame.command(), error = %e, "Engine channel poisoned");
                self.stream.lock().await.take();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<S> EngineControl for EngineChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn request_catalog(&self) -> Result<DeviceCatalog, ChannelError> {
        self.request(&ControlFrame::Config, |codec, data| codec.decode_catalog(data))
            .await
    }

    async fn request_connect(
        &self,
        config: Option<&MediaConfig>,
    ) -> Result<ConnectReply, ChannelError> {
        let frame = ControlFrame::Connect {
            config: config.cloned(),
        };
        self.request(&frame, |codec, data| codec.decode_connect(data))
            .await
    }

    async fn start_stream(
        &self,
        remote: SocketAddr,
        direction: StreamDirection,
        config: &MediaConfig,
    ) -> Result<(), ChannelError> {
        let frame = ControlFrame::Stream {
            remote_addr: remote,
            mode: direction,
            config: config.clone(),
        };
        self.transact(&frame).await.map(|_| ())
    }

    async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "Engine stream shutdown failed");
            }
            debug!("Engine channel closed");
        }
    }
}

// ---------------------------------------------------------------------------
// Unix socket connect
// ---------------------------------------------------------------------------

/// Connects to the engine's socket, retrying while the engine starts up.
///
/// Fails with [`ChannelError::Unavailable`] once `retry` is exhausted.
#[cfg(unix)]
pub async fn connect_channel(
    path: &std::path::Path,
    retry: crate::application::retry::RetryPolicy,
    options: &ChannelOptions,
) -> Result<EngineChannel<tokio::net::UnixStream>, ChannelError> {
    use crate::application::retry::retry_fixed;

    let stream = retry_fixed(retry, |attempt| {
        debug!(attempt, path = %path.display(), "Connecting to engine");
        tokio::net::UnixStream::connect(path)
    })
    .await
    .map_err(|e| ChannelError::Unavailable {
        attempts: e.attempts,
        source: e.last,
    })?;
    tracing::info!(path = %path.display(), "Connected to engine");
    Ok(EngineChannel::new(stream, options))
}
