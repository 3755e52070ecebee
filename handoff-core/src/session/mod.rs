//! Session Lifecycle
//!
//! Owns the local session: hosting or joining one, the channel bound to it,
//! and the sends that go out over that channel.

mod manager;
mod state;

pub use manager::SessionManager;
pub use state::{SessionPhase, SessionRole, SessionSnapshot};

use thiserror::Error;

use crate::transport::TransportError;

/// Default name of the channel handoff messages travel on
pub const DEFAULT_CHANNEL_NAME: &str = "Media";

/// Session name used when the caller does not pick one
pub const DEFAULT_SESSION_NAME: &str = "Connected Experience";

/// Session manager configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name of the channel opened on every session
    pub channel_name: String,
    /// Display name for hosted sessions when none is given
    pub default_session_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            default_session_name: DEFAULT_SESSION_NAME.to_string(),
        }
    }
}

/// Errors surfaced by [`SessionManager`] operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Access to remote sessions was denied")]
    AccessDenied,

    #[error("Failed to create session: {0}")]
    CreateFailed(String),

    #[error("Failed to join session: {0}")]
    JoinFailed(String),

    #[error("Failed to send: {0}")]
    SendFailed(String),

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Session manager is shut down")]
    Closed,
}

impl SessionError {
    pub(crate) fn from_discovery(e: TransportError) -> Self {
        match e {
            TransportError::AccessDenied => SessionError::AccessDenied,
            other => SessionError::DiscoveryFailed(other.to_string()),
        }
    }
}
