//! Subcommand handlers.

use anyhow::Context;
use clap::Args;
use tracing::info;

use peerlink_core::application::context::SessionContext;
use peerlink_core::domain::media::{DeviceCatalog, MediaConfig};
use peerlink_core::domain::session::SessionId;

/// Overrides for the negotiated audio configuration.
#[derive(Debug, Default, Args)]
pub struct MediaArgs {
    /// Audio host (driver API); defaults to the first one with usable devices.
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub input_device: Option<String>,
    #[arg(long)]
    pub output_device: Option<String>,
    #[arg(long)]
    pub sample_rate: Option<u32>,
    /// One of 64, 128, 256, 512.
    #[arg(long)]
    pub buffer_size: Option<u32>,
    #[arg(long)]
    pub stereo: bool,
    #[arg(long)]
    pub input_channel: Option<u32>,
    #[arg(long)]
    pub output_channel: Option<u32>,
}

pub async fn catalog(ctx: &SessionContext) -> anyhow::Result<()> {
    let catalog = ctx
        .engine()
        .request_catalog()
        .await
        .context("requesting device catalog")?;
    println!("{}", serde_json::to_string_pretty(&catalog)?);
    Ok(())
}

/// Creates a session, acknowledges the first peer, and streams until Ctrl-C.
pub async fn listen(ctx: &SessionContext, media: &MediaArgs) -> anyhow::Result<()> {
    let catalog = ctx
        .engine()
        .request_catalog()
        .await
        .context("requesting device catalog")?;
    let config = choose_config(&catalog, media)?;
    info!(?config, "Using audio configuration");

    let listener = ctx.listener();
    let id = listener.start(config).await.context("creating session")?;
    println!("session id: {id}");

    tokio::select! {
        ready = listener.wait_until_actionable() => ready.context("waiting for a peer")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before a peer joined");
            return Ok(());
        }
    }
    listener.acknowledge().await.context("acknowledging peer")?;
    println!("streaming; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Joins `id`, streams once the listener acknowledges, and runs until Ctrl-C.
pub async fn join(ctx: &SessionContext, id: SessionId) -> anyhow::Result<()> {
    let initiator = ctx.initiator();
    initiator
        .start(id.clone())
        .await
        .with_context(|| format!("joining session {id}"))?;

    tokio::select! {
        ready = initiator.wait_until_actionable() => ready.context("waiting for the listener")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before the listener acknowledged");
            return Ok(());
        }
    }
    initiator.stream().await.context("starting stream")?;
    println!("streaming; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Negotiates a config from the catalog, then applies explicit overrides.
fn choose_config(catalog: &DeviceCatalog, media: &MediaArgs) -> anyhow::Result<MediaConfig> {
    let negotiated = match &media.host {
        Some(host) => {
            let input = match &media.input_device {
                Some(device) => device.clone(),
                None => first_device(catalog, host, |input, _| input > 0)
                    .with_context(|| format!("no input device on host {host}"))?,
            };
            let output = match &media.output_device {
                Some(device) => device.clone(),
                None => first_device(catalog, host, |_, output| output > 0)
                    .with_context(|| format!("no output device on host {host}"))?,
            };
            catalog.negotiate(host, &input, &output, media.stereo)
        }
        None => catalog.negotiate_default(media.stereo),
    };
    let mut config = negotiated.context("no audio configuration both devices support")?;

    if let Some(rate) = media.sample_rate {
        config.sample_rate = rate;
    }
    if let Some(size) = media.buffer_size {
        config.buffer_size = size;
    }
    if let Some(channel) = media.input_channel {
        config.input_channel = channel;
    }
    if let Some(channel) = media.output_channel {
        config.output_channel = channel;
    }
    config
        .validate_against(catalog)
        .context("requested audio configuration is not supported")?;
    Ok(config)
}

fn first_device(
    catalog: &DeviceCatalog,
    host: &str,
    usable: impl Fn(u16, u16) -> bool,
) -> Option<String> {
    catalog
        .devices(host)
        .find(|(_, caps)| usable(caps.input.channels, caps.output.channels))
        .map(|(name, _)| name.to_owned())
}
