//! Local media engine: framed Unix-socket channel, payload codecs, and the
//! process launcher.

pub mod channel;
pub mod codec;
pub mod framing;
pub mod process;

pub use channel::{ChannelOptions, EngineChannel};
#[cfg(unix)]
pub use channel::connect_channel;
pub use process::EngineProcess;
