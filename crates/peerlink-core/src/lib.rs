//! peerlink-core: relay rendezvous handshake and local media-engine control.
//!
//! # Architecture (Clean Architecture)
//!
//! - **domain**: session records, media configs, device catalogs, engine
//!   commands (no I/O).
//! - **application**: port traits, the rendezvous client, the listener and
//!   initiator handshake machines, and the session context that owns them.
//! - **adapters**: framed Unix-socket engine channel (JSON / CBOR), engine
//!   process launcher, HTTP + WebSocket relay, in-memory relay.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;

#[cfg(test)]
pub(crate) mod testing;
