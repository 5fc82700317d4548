//! Control-plane commands exchanged with the local media engine.
//!
//! These travel over the private engine socket, one command per frame.
//! Pure data, no I/O.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::media::{MediaConfig, StreamDirection};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A command sent to the engine. Serialized with a `type` discriminant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Ask for the device catalog. Answered with a
    /// [`DeviceCatalog`](super::media::DeviceCatalog).
    Config,
    /// Validate a config and bind a local media endpoint. Answered with a
    /// [`ConnectReply`]. Without a config the engine uses its defaults.
    Connect {
        #[serde(default)]
        config: Option<MediaConfig>,
    },
    /// Start streaming toward `remote_addr`. Not answered.
    Stream {
        #[serde(with = "addr_text")]
        remote_addr: SocketAddr,
        mode: StreamDirection,
        config: MediaConfig,
    },
}

impl ControlFrame {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Connect { .. } => "connect",
            Self::Stream { .. } => "stream",
        }
    }

    /// Whether the engine answers this command with exactly one frame.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Self::Stream { .. })
    }
}

/// Endpoints inside tagged commands always travel as `ip:port` text, also
/// in binary codecs.
mod addr_text {
    use std::net::SocketAddr;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(addr)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        String::deserialize(d)?.parse().map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// Engine answer to [`ControlFrame::Connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectReply {
    /// Endpoint the engine bound for media; publishable to the peer.
    pub address: SocketAddr,
    /// `false` when the config cannot run on local hardware.
    pub is_valid: bool,
}
