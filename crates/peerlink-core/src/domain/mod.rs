//! Domain types shared by every layer. Pure data, no I/O.

pub mod control;
pub mod media;
pub mod session;
