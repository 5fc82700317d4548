//! Configuration loading.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. a TOML file: the explicit path, else `PEERLINK_CONFIG_PATH`, else
//!    `./peerlink.toml` if present
//! 3. environment overrides (`PEERLINK_RELAY_URL`, `PEERLINK_PUSH_URL`,
//!    `PEERLINK_ENGINE_BINARY`, `PEERLINK_SOCKET_DIR`)
//!
//! The result is validated before it is returned.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adapters::engine::codec::CodecKind;
use crate::adapters::engine::framing::{Framing, DEFAULT_MAX_FRAME_LEN, LEGACY_FRAME_LEN};
use crate::adapters::engine::ChannelOptions;
use crate::application::retry::RetryPolicy;

pub const CONFIG_PATH_ENV: &str = "PEERLINK_CONFIG_PATH";
pub const DEFAULT_CONFIG_FILE: &str = "peerlink.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerlinkConfig {
    pub relay: RelayConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// `http(s)://` base of the request/response API.
    pub base_url: String,
    /// `ws(s)://` base of the push channel.
    pub push_url: String,
    pub request_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            push_url: "ws://127.0.0.1:8001".into(),
            request_timeout_ms: 10_000,
        }
    }
}

impl RelayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FramingKind {
    #[default]
    LengthPrefixed,
    Padded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub binary: PathBuf,
    /// Extra arguments passed before the socket path.
    pub args: Vec<String>,
    pub socket_dir: PathBuf,
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
    pub response_timeout_ms: u64,
    pub framing: FramingKind,
    /// Frame bound; defaults to 64 KiB, or 256 bytes for padded framing.
    pub max_frame_len: Option<usize>,
    pub codec: CodecKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("peerlink-engine"),
            args: Vec::new(),
            socket_dir: env::temp_dir().join("peerlink"),
            connect_attempts: RetryPolicy::ENGINE_STARTUP.attempts,
            retry_delay_ms: 500,
            response_timeout_ms: 5_000,
            framing: FramingKind::default(),
            max_frame_len: None,
            codec: CodecKind::default(),
        }
    }
}

impl EngineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn framing(&self) -> Framing {
        match self.framing {
            FramingKind::LengthPrefixed => Framing::LengthPrefixed {
                max_len: self.max_frame_len.unwrap_or(DEFAULT_MAX_FRAME_LEN),
            },
            FramingKind::Padded => Framing::Padded {
                frame_len: self.max_frame_len.unwrap_or(LEGACY_FRAME_LEN),
            },
        }
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            framing: self.framing(),
            codec: self.codec,
            response_timeout: Duration::from_millis(self.response_timeout_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Loads, overrides and validates the configuration.
pub fn load_config(path: Option<&Path>) -> ConfigResult<PeerlinkConfig> {
    load_with(path, |key| env::var(key).ok())
}

fn load_with(
    path: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> ConfigResult<PeerlinkConfig> {
    let mut config = match find_config_file(path, &lookup)? {
        Some(file) => {
            let content = fs::read_to_string(&file).map_err(|source| ConfigError::Io {
                path: file.clone(),
                source,
            })?;
            info!(path = %file.display(), "Loaded configuration");
            toml::from_str(&content)?
        }
        None => {
            debug!("No configuration file, using defaults");
            PeerlinkConfig::default()
        }
    };
    apply_overrides(&mut config, &lookup);
    validate(&config)?;
    Ok(config)
}

/// Resolves which file to read. An explicit or env-named file must exist;
/// the working-directory default is optional.
fn find_config_file(
    path: Option<&Path>,
    lookup: &impl Fn(&str) -> Option<String>,
) -> ConfigResult<Option<PathBuf>> {
    let named = path
        .map(Path::to_path_buf)
        .or_else(|| lookup(CONFIG_PATH_ENV).map(PathBuf::from));
    if let Some(file) = named {
        if !file.exists() {
            return Err(ConfigError::NotFound(file));
        }
        return Ok(Some(file));
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    Ok(local.exists().then_some(local))
}

fn apply_overrides(config: &mut PeerlinkConfig, lookup: &impl Fn(&str) -> Option<String>) {
    if let Some(value) = lookup("PEERLINK_RELAY_URL") {
        config.relay.base_url = value;
    }
    if let Some(value) = lookup("PEERLINK_PUSH_URL") {
        config.relay.push_url = value;
    }
    if let Some(value) = lookup("PEERLINK_ENGINE_BINARY") {
        config.engine.binary = PathBuf::from(value);
    }
    if let Some(value) = lookup("PEERLINK_SOCKET_DIR") {
        config.engine.socket_dir = PathBuf::from(value);
    }
}

pub fn validate(config: &PeerlinkConfig) -> ConfigResult<()> {
    let relay = &config.relay;
    if !(relay.base_url.starts_with("http://") || relay.base_url.starts_with("https://")) {
        return Err(invalid("relay.base_url", "must be an http:// or https:// URL"));
    }
    if !(relay.push_url.starts_with("ws://") || relay.push_url.starts_with("wss://")) {
        return Err(invalid("relay.push_url", "must be a ws:// or wss:// URL"));
    }
    if relay.request_timeout_ms == 0 {
        return Err(invalid("relay.request_timeout_ms", "must be positive"));
    }

    let engine = &config.engine;
    if engine.connect_attempts == 0 {
        return Err(invalid("engine.connect_attempts", "must be at least 1"));
    }
    if engine.response_timeout_ms == 0 {
        return Err(invalid("engine.response_timeout_ms", "must be positive"));
    }
    let bound = engine.framing().bound();
    if bound < 2 || bound > u32::MAX as usize {
        return Err(invalid(
            "engine.max_frame_len",
            format!("{bound} is outside 2..={}", u32::MAX),
        ));
    }
    if engine.framing == FramingKind::Padded && engine.codec == CodecKind::Cbor {
        return Err(invalid(
            "engine.codec",
            "padded framing strips trailing NULs and needs the json codec",
        ));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}
