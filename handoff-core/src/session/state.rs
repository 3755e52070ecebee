//! Session State Management

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::transport::{Channel, Session, SessionController};

/// Where the manager is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No session
    #[default]
    Idle,
    /// Waiting for the platform to grant access
    Requesting,
    /// Creating a hosted session
    Hosting,
    /// Joining a remote session
    Joining,
    /// Session and channel are live
    Active,
    /// Shut down for good
    Closed,
}

impl SessionPhase {
    /// Check if a session and channel are live
    pub fn is_active(&self) -> bool {
        matches!(self, SessionPhase::Active)
    }
}

/// Whether we created the session or joined someone else's
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Host,
    Guest,
}

/// Read-only view of the current session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub display_name: String,
    pub controller_display_name: String,
    pub role: SessionRole,
}

/// The live session and everything bound to it.
///
/// Dropping it closes the channel, stops its tasks and disposes the session.
pub(crate) struct ActiveSession {
    pub role: SessionRole,
    pub session: Arc<dyn Session>,
    pub channel: Arc<dyn Channel>,
    pub dispatch: JoinHandle<()>,
    pub join_pump: Option<JoinHandle<()>>,
    /// Host controller, kept alive for as long as the session is
    pub controller: Option<Box<dyn SessionController>>,
}

impl ActiveSession {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session.id().to_string(),
            display_name: self.session.display_name().to_string(),
            controller_display_name: self.session.controller_display_name().to_string(),
            role: self.role,
        }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.dispatch.abort();
        if let Some(pump) = &self.join_pump {
            pump.abort();
        }
        self.channel.close();
        self.session.dispose();
        self.controller.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_defaults_to_idle() {
        assert_eq!(SessionPhase::default(), SessionPhase::Idle);
        assert!(SessionPhase::Active.is_active());
        assert!(!SessionPhase::Joining.is_active());
    }
}
