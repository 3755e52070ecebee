//! Transport over libp2p
//!
//! Adapts a running [`NetworkHandle`] to the transport traits the session
//! layer is written against.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::behaviour::{NetworkError, NetworkHandle};
use crate::sync::{Envelope, RemoteSessionInfo};
use crate::transport::{
    AccessStatus, Channel, ChannelEndpoint, DiscoveryEvent, DiscoveryWatcher, JoinRequest, Session,
    SessionController, Transport, TransportError,
};

/// [`Transport`] backed by the libp2p network task
pub struct P2pTransport {
    handle: NetworkHandle,
}

impl P2pTransport {
    pub fn new(handle: NetworkHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &NetworkHandle {
        &self.handle
    }
}

#[async_trait]
impl Transport for P2pTransport {
    // Local networking needs no platform grant
    async fn request_access(&self) -> AccessStatus {
        AccessStatus::Granted
    }

    fn create_controller(&self, display_name: &str) -> Box<dyn SessionController> {
        let (join_tx, join_rx) = mpsc::unbounded_channel();
        Box::new(P2pController {
            handle: self.handle.clone(),
            display_name: display_name.to_string(),
            join_tx,
            join_rx: Mutex::new(Some(join_rx)),
        })
    }

    fn create_discovery_watcher(&self) -> Box<dyn DiscoveryWatcher> {
        Box::new(P2pWatcher {
            handle: self.handle.clone(),
            id: self.handle.next_id(),
        })
    }

    async fn join(&self, info: &RemoteSessionInfo) -> Result<Arc<dyn Session>, TransportError> {
        self.handle
            .join(info)
            .await
            .map_err(|e| TransportError::JoinFailed(e.to_string()))?;

        Ok(Arc::new(P2pSession {
            handle: self.handle.clone(),
            info: info.clone(),
            hosted: false,
            disposed: AtomicBool::new(false),
        }))
    }

    async fn open_channel(
        &self,
        session: &Arc<dyn Session>,
        name: &str,
    ) -> Result<ChannelEndpoint, TransportError> {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let id = self.handle.next_id();
        self.handle
            .open_channel(id, session.id(), name, frames_tx)
            .map_err(|_| TransportError::Closed)?;

        Ok(ChannelEndpoint {
            channel: Arc::new(P2pChannel {
                handle: self.handle.clone(),
                id,
                session_id: session.id().to_string(),
                name: name.to_string(),
                closed: AtomicBool::new(false),
            }),
            frames: frames_rx,
        })
    }
}

struct P2pController {
    handle: NetworkHandle,
    display_name: String,
    join_tx: mpsc::UnboundedSender<JoinRequest>,
    join_rx: Mutex<Option<mpsc::UnboundedReceiver<JoinRequest>>>,
}

#[async_trait]
impl SessionController for P2pController {
    fn join_requests(&self) -> Option<mpsc::UnboundedReceiver<JoinRequest>> {
        self.join_rx.lock().take()
    }

    async fn create_session(&self) -> Result<Arc<dyn Session>, TransportError> {
        let info = self
            .handle
            .host(&self.display_name, self.join_tx.clone())
            .await
            .map_err(|e| TransportError::CreateFailed(e.to_string()))?;

        Ok(Arc::new(P2pSession {
            handle: self.handle.clone(),
            info,
            hosted: true,
            disposed: AtomicBool::new(false),
        }))
    }
}

struct P2pSession {
    handle: NetworkHandle,
    info: RemoteSessionInfo,
    hosted: bool,
    disposed: AtomicBool,
}

impl Session for P2pSession {
    fn id(&self) -> &str {
        &self.info.session_id
    }

    fn display_name(&self) -> &str {
        &self.info.display_name
    }

    fn controller_display_name(&self) -> &str {
        &self.info.controller_display_name
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.hosted {
            self.handle.withdraw(&self.info.session_id);
        } else {
            self.handle.leave(&self.info.session_id);
        }
    }
}

impl Drop for P2pSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct P2pWatcher {
    handle: NetworkHandle,
    id: u64,
}

impl DiscoveryWatcher for P2pWatcher {
    fn start(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.handle.watch(self.id, tx).map_err(|_| TransportError::Closed)?;
        Ok(rx)
    }

    fn stop(&self) {
        self.handle.unwatch(self.id);
    }
}

struct P2pChannel {
    handle: NetworkHandle,
    id: u64,
    session_id: String,
    name: String,
    closed: AtomicBool,
}

#[async_trait]
impl Channel for P2pChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.handle
            .send_frame(&self.session_id, &self.name, envelope)
            .await
            .map_err(|e| match e {
                NetworkError::Closed => TransportError::Closed,
                other => TransportError::SendFailed(other.to_string()),
            })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing channel {} on {}", self.name, self.session_id);
        self.handle.close_channel(self.id);
    }
}
