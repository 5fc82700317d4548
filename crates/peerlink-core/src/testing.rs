//! Shared fixtures for unit tests: a scripted engine and sample configs.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::application::ports::EngineControl;
use crate::domain::control::ConnectReply;
use crate::domain::media::{
    BufferRange, DeviceCaps, DeviceCatalog, DirectionCaps, MediaConfig, StreamDirection,
};
use crate::error::ChannelError;

pub fn config() -> MediaConfig {
    MediaConfig {
        host: "ALSA".into(),
        input_device: "default".into(),
        output_device: "default".into(),
        sample_rate: 48_000,
        buffer_size: 128,
        stereo: false,
        input_channel: 0,
        output_channel: 0,
    }
}

pub fn catalog() -> DeviceCatalog {
    let caps = DirectionCaps {
        sample_rates: vec![44_100, 48_000],
        buffer_size: BufferRange { min: 64, max: 512 },
        channels: 2,
    };
    let mut catalog = DeviceCatalog::new();
    catalog.insert(
        "ALSA",
        "default",
        DeviceCaps {
            input: caps.clone(),
            output: caps,
        },
    );
    catalog
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// What a [`ScriptedEngine`] was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Catalog,
    Connect(Option<MediaConfig>),
    Stream {
        remote: SocketAddr,
        direction: StreamDirection,
        config: MediaConfig,
    },
    Close,
}

/// [`EngineControl`] that answers from a script and records every call.
pub struct ScriptedEngine {
    connect_replies: Mutex<VecDeque<ConnectReply>>,
    unavailable: bool,
    calls: Mutex<Vec<EngineCall>>,
}

impl ScriptedEngine {
    /// Answers every `connect` with `reply`, unless more replies are queued.
    pub fn accepting(address: &str) -> Self {
        Self::with_replies([ConnectReply {
            address: addr(address),
            is_valid: true,
        }])
    }

    /// Answers every `connect` with an invalid reply.
    pub fn rejecting() -> Self {
        Self::with_replies([ConnectReply {
            address: addr("127.0.0.1:0"),
            is_valid: false,
        }])
    }

    /// Fails every command as if the engine never came up.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::with_replies([])
        }
    }

    /// Pops one reply per `connect`; the last one repeats.
    pub fn with_replies(replies: impl IntoIterator<Item = ConnectReply>) -> Self {
        Self {
            connect_replies: Mutex::new(replies.into_iter().collect()),
            unavailable: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stream_calls(&self) -> Vec<EngineCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, EngineCall::Stream { .. }))
            .collect()
    }

    fn record(&self, call: EngineCall) -> Result<(), ChannelError> {
        self.calls.lock().unwrap().push(call);
        if self.unavailable {
            return Err(ChannelError::Unavailable {
                attempts: 6,
                source: std::io::ErrorKind::ConnectionRefused.into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EngineControl for ScriptedEngine {
    async fn request_catalog(&self) -> Result<DeviceCatalog, ChannelError> {
        self.record(EngineCall::Catalog)?;
        Ok(catalog())
    }

    async fn request_connect(
        &self,
        config: Option<&MediaConfig>,
    ) -> Result<ConnectReply, ChannelError> {
        self.record(EngineCall::Connect(config.cloned()))?;
        let mut replies = self.connect_replies.lock().unwrap();
        let reply = if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().copied()
        };
        reply.ok_or(ChannelError::UnexpectedEof)
    }

    async fn start_stream(
        &self,
        remote: SocketAddr,
        direction: StreamDirection,
        config: &MediaConfig,
    ) -> Result<(), ChannelError> {
        self.record(EngineCall::Stream {
            remote,
            direction,
            config: config.clone(),
        })
    }

    async fn close(&self) {
        self.calls.lock().unwrap().push(EngineCall::Close);
    }
}
