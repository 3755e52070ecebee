//! Transport Capability
//!
//! The seam between the session core and whatever actually moves bytes
//! between devices. The core only ever talks to these traits; notifications
//! flow back as messages on tokio channels so each one can be consumed by a
//! single task in arrival order.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::sync::{Envelope, RemoteSessionInfo};

/// Result of asking the platform for permission to use remote sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Granted,
    Denied,
}

/// Errors reported by a transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Access to remote sessions was denied")]
    AccessDenied,

    #[error("Failed to create session: {0}")]
    CreateFailed(String),

    #[error("Failed to join session: {0}")]
    JoinFailed(String),

    #[error("Failed to send frame: {0}")]
    SendFailed(String),

    #[error("Transport closed")]
    Closed,
}

/// Discovery notification emitted by a [`DiscoveryWatcher`]
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Added(RemoteSessionInfo),
    Removed(RemoteSessionInfo),
    Updated(RemoteSessionInfo),
}

/// A frame received on a session channel
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Participant that sent the frame
    pub sender: String,
    pub envelope: Envelope,
}

/// A request from a remote participant to join a hosted session.
///
/// Dropping the request without answering counts as a decline.
pub struct JoinRequest {
    participant: String,
    reply: oneshot::Sender<bool>,
}

impl JoinRequest {
    pub fn new(participant: impl Into<String>, reply: oneshot::Sender<bool>) -> Self {
        Self {
            participant: participant.into(),
            reply,
        }
    }

    /// Display name (or id, if none) of the participant asking to join
    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn accept(self) {
        let _ = self.reply.send(true);
    }

    pub fn decline(self) {
        let _ = self.reply.send(false);
    }
}

impl fmt::Debug for JoinRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinRequest")
            .field("participant", &self.participant)
            .finish()
    }
}

/// A live hosted or joined session
pub trait Session: Send + Sync {
    fn id(&self) -> &str;
    fn display_name(&self) -> &str;
    fn controller_display_name(&self) -> &str;
    /// Release the session. Idempotent.
    fn dispose(&self);
}

/// Host-side session factory
#[async_trait]
pub trait SessionController: Send + Sync {
    /// Stream of join requests for sessions created by this controller.
    /// Only the first call returns a receiver.
    fn join_requests(&self) -> Option<mpsc::UnboundedReceiver<JoinRequest>>;

    async fn create_session(&self) -> Result<Arc<dyn Session>, TransportError>;
}

/// Watches for remote sessions being advertised
pub trait DiscoveryWatcher: Send + Sync {
    fn start(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, TransportError>;
    /// Stop emitting notifications. Idempotent.
    fn stop(&self);
}

/// Sending half of a named session channel
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;
    /// Broadcast an envelope to every other participant in the session
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
    fn close(&self);
}

/// An opened channel: the sender plus the queue of inbound frames
pub struct ChannelEndpoint {
    pub channel: Arc<dyn Channel>,
    pub frames: mpsc::UnboundedReceiver<InboundFrame>,
}

/// The capability the session core depends on
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_access(&self) -> AccessStatus;

    fn create_controller(&self, display_name: &str) -> Box<dyn SessionController>;

    fn create_discovery_watcher(&self) -> Box<dyn DiscoveryWatcher>;

    async fn join(&self, info: &RemoteSessionInfo) -> Result<Arc<dyn Session>, TransportError>;

    async fn open_channel(
        &self,
        session: &Arc<dyn Session>,
        name: &str,
    ) -> Result<ChannelEndpoint, TransportError>;
}
