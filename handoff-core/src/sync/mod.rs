//! Sync Engine
//!
//! Wire messages exchanged on a session channel and the directory of
//! sessions we can join.

pub mod directory;
mod protocol;
pub mod timespan;

pub use directory::{Discovery, RemoteSessionInfo, SessionDirectory};
pub use protocol::*;
