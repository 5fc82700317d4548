pub mod ports;

pub mod context;
pub mod initiator;
pub mod listener;
pub(crate) mod machine;
pub mod rendezvous;
pub mod retry;

pub use machine::{RoleState, Status};
