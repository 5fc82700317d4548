//! Relay transports: HTTP + WebSocket for real relays, in-memory for tests
//! and loopback runs.

pub mod http;
pub mod memory;

pub use http::HttpRelay;
pub use memory::InMemoryRelay;
