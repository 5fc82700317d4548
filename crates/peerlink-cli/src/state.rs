//! Process-wide runtime: the spawned engine and the session context built
//! on top of it.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use peerlink_core::adapters::engine::{connect_channel, EngineProcess};
use peerlink_core::adapters::relay::HttpRelay;
use peerlink_core::application::context::SessionContext;
use peerlink_core::config::PeerlinkConfig;

pub struct Runtime {
    engine: EngineProcess,
    context: SessionContext,
}

impl Runtime {
    /// Spawns the engine, waits for its socket, and connects to the relay.
    pub async fn start(config: &PeerlinkConfig) -> anyhow::Result<Self> {
        let engine = EngineProcess::spawn(
            &config.engine.binary,
            &config.engine.args,
            &config.engine.socket_dir,
        )
        .with_context(|| format!("spawning engine {}", config.engine.binary.display()))?;

        let channel = match connect_channel(
            engine.socket_path(),
            config.engine.retry_policy(),
            &config.engine.channel_options(),
        )
        .await
        {
            Ok(channel) => channel,
            Err(e) => {
                stop_engine(engine).await;
                return Err(e).context("connecting to the engine");
            }
        };

        let relay = HttpRelay::new(
            &config.relay.base_url,
            &config.relay.push_url,
            config.relay.request_timeout(),
        )
        .context("building relay client")?;

        info!(socket = %engine.socket_path().display(), "Runtime ready");
        Ok(Self {
            engine,
            context: SessionContext::new(Arc::new(channel), Arc::new(relay)),
        })
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Cancels every session, closes the engine channel, then stops the engine.
    pub async fn shutdown(self) {
        self.context.shutdown().await;
        stop_engine(self.engine).await;
    }
}

async fn stop_engine(engine: EngineProcess) {
    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "Failed to stop engine");
    }
}
