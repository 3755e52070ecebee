//! Handoff - Core Library
//!
//! This library provides the cross-device session layer for handing off media
//! playback: discovering peer sessions, hosting or joining one, and exchanging
//! scrub progress and full playback state over a session channel.

pub mod events;
pub mod ffi;
pub mod network;
pub mod session;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use events::{EventHub, Subscription};
pub use session::{SessionConfig, SessionError, SessionManager, SessionPhase};
pub use sync::{Envelope, HandoffPayload, RemoteSessionInfo, SessionDirectory, SyncMessage};
pub use transport::{Transport, TransportError};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
