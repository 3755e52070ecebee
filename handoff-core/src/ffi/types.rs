//! FFI types exposed via uniffi

use crate::network::NetworkError as InternalNetworkError;
use crate::session::{SessionError, SessionPhase, SessionRole, SessionSnapshot};
use crate::sync::{HandoffPayload, RemoteSessionInfo};

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Access to remote sessions was denied")]
    AccessDenied,

    #[error("Failed to create session: {0}")]
    CreateFailed(String),

    #[error("Failed to join session: {0}")]
    JoinFailed(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Failed to send: {0}")]
    SendFailed(String),

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Session is shut down")]
    Closed,
}

impl From<SessionError> for CoreError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::AccessDenied => CoreError::AccessDenied,
            SessionError::CreateFailed(msg) => CoreError::CreateFailed(msg),
            SessionError::JoinFailed(msg) => CoreError::JoinFailed(msg),
            SessionError::SendFailed(msg) => CoreError::SendFailed(msg),
            SessionError::DiscoveryFailed(msg) => CoreError::DiscoveryFailed(msg),
            SessionError::Closed => CoreError::Closed,
        }
    }
}

impl From<InternalNetworkError> for CoreError {
    fn from(e: InternalNetworkError) -> Self {
        match e {
            InternalNetworkError::Closed => CoreError::Closed,
            other => CoreError::NetworkError(other.to_string()),
        }
    }
}

/// A remote session exposed via FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct SessionInfo {
    pub session_id: String,
    pub display_name: String,
    pub controller_display_name: String,
}

impl From<&RemoteSessionInfo> for SessionInfo {
    fn from(info: &RemoteSessionInfo) -> Self {
        Self {
            session_id: info.session_id.clone(),
            display_name: info.display_name.clone(),
            controller_display_name: info.controller_display_name.clone(),
        }
    }
}

/// The session we host or have joined
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct CurrentSession {
    pub session_id: String,
    pub display_name: String,
    pub controller_display_name: String,
    pub is_host: bool,
}

impl From<SessionSnapshot> for CurrentSession {
    fn from(s: SessionSnapshot) -> Self {
        Self {
            session_id: s.session_id,
            display_name: s.display_name,
            controller_display_name: s.controller_display_name,
            is_host: s.role == SessionRole::Host,
        }
    }
}

/// Session phase exposed via FFI
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum HandoffPhase {
    Idle,
    Requesting,
    Hosting,
    Joining,
    Active,
    Closed,
}

impl From<SessionPhase> for HandoffPhase {
    fn from(phase: SessionPhase) -> Self {
        match phase {
            SessionPhase::Idle => HandoffPhase::Idle,
            SessionPhase::Requesting => HandoffPhase::Requesting,
            SessionPhase::Hosting => HandoffPhase::Hosting,
            SessionPhase::Joining => HandoffPhase::Joining,
            SessionPhase::Active => HandoffPhase::Active,
            SessionPhase::Closed => HandoffPhase::Closed,
        }
    }
}

/// A media handoff received from the other side
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct HandoffInfo {
    /// Card description, passed through as received
    pub card_json: String,
    pub played_position_ms: u64,
    pub media_url: String,
}

impl From<&HandoffPayload> for HandoffInfo {
    fn from(p: &HandoffPayload) -> Self {
        Self {
            card_json: p.card_json.clone(),
            played_position_ms: u64::try_from(p.played_position.as_millis()).unwrap_or(u64::MAX),
            media_url: p.media_url.clone(),
        }
    }
}

/// Callback interface for session events.
///
/// Invoked from background threads. Implementations must not call back into
/// the session synchronously.
#[uniffi::export(callback_interface)]
pub trait HandoffCallback: Send + Sync {
    /// Human-readable progress line
    fn on_status(&self, message: String);
    fn on_sessions_changed(&self, sessions: Vec<SessionInfo>);
    /// Scrub position shared by the other side
    fn on_progress(&self, position: f32);
    fn on_handoff(&self, handoff: HandoffInfo);
    /// The other side wants our media handed over
    fn on_media_requested(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_handoff_info_in_millis() {
        let payload = HandoffPayload::new("{}", Duration::from_micros(83_500_900), "u");
        let info = HandoffInfo::from(&payload);
        assert_eq!(info.played_position_ms, 83_500);
        assert_eq!(info.card_json, "{}");
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(CoreError::from(SessionError::AccessDenied), CoreError::AccessDenied));
        assert!(matches!(
            CoreError::from(SessionError::SendFailed("x".into())),
            CoreError::SendFailed(msg) if msg == "x"
        ));
        assert!(matches!(CoreError::from(InternalNetworkError::Closed), CoreError::Closed));
        assert!(matches!(
            CoreError::from(InternalNetworkError::JoinTimeout),
            CoreError::NetworkError(_)
        ));
    }

    #[test]
    fn test_current_session_role() {
        let snapshot = SessionSnapshot {
            session_id: "ABCDEFGH".into(),
            display_name: "Movie".into(),
            controller_display_name: "tv".into(),
            role: SessionRole::Guest,
        };
        assert!(!CurrentSession::from(snapshot).is_host);
    }
}
