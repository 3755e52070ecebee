//! Session implementation for FFI

use std::sync::{Arc, Once};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::events::{EventHub, Subscription};
use crate::network::{NetworkConfig, NetworkHandle, NetworkManager, P2pTransport, SessionCode};
use crate::session::SessionManager;

use super::handlers::{forward_events, SharedCallback};
use super::types::*;

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        for directive in ["handoff_core=debug", "libp2p_mdns=info", "libp2p_gossipsub=info"] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
        let _ = tracing_subscriber::fmt()
            .with_ansi(false) // Disable colors for Xcode console
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Main session interface
#[derive(uniffi::Object)]
pub struct HandoffSession {
    runtime: Runtime,
    manager: Arc<SessionManager>,
    network: NetworkHandle,
    callback: SharedCallback,
    subscriptions: Mutex<Vec<Subscription>>,
}

#[uniffi::export]
impl HandoffSession {
    /// Create a session layer for this device and start networking
    #[uniffi::constructor]
    pub fn new(device_name: String) -> Result<Arc<Self>, CoreError> {
        let config = NetworkConfig {
            device_name,
            ..NetworkConfig::default()
        };
        Self::with_config(config).map(Arc::new)
    }

    /// Set the event callback
    pub fn set_callback(&self, callback: Box<dyn HandoffCallback>) {
        *self.callback.write() = Some(Arc::from(callback));
    }

    /// Start (or restart) looking for sessions on the network
    pub fn start_discovery(&self) -> Result<(), CoreError> {
        self.runtime
            .block_on(self.manager.start_discovery())
            .map_err(CoreError::from)
    }

    pub fn stop_discovery(&self) {
        self.runtime.block_on(self.manager.stop_discovery());
    }

    /// Sessions currently visible on the network
    pub fn available_sessions(&self) -> Vec<SessionInfo> {
        self.manager.sessions().iter().map(SessionInfo::from).collect()
    }

    pub fn current_session(&self) -> Option<CurrentSession> {
        self.manager.current_session().map(CurrentSession::from)
    }

    pub fn phase(&self) -> HandoffPhase {
        self.manager.phase().into()
    }

    /// Host a session, replacing any current one
    pub fn create_session(&self, display_name: Option<String>) -> Result<CurrentSession, CoreError> {
        let display_name = display_name.unwrap_or_default();
        self.runtime
            .block_on(self.manager.create_session(&display_name))
            .map_err(CoreError::from)?;
        self.current_session()
            .ok_or_else(|| CoreError::CreateFailed("session closed while starting".to_string()))
    }

    /// Join a session from the directory. Accepts the code as typed by a user.
    pub fn join_session(&self, session_id: String) -> Result<(), CoreError> {
        let info = self
            .manager
            .find_session(&session_id)
            .or_else(|| {
                SessionCode::parse(&session_id).and_then(|code| self.manager.find_session(code.as_str()))
            })
            .ok_or_else(|| CoreError::SessionNotFound(session_id.clone()))?;

        info!("Joining {} hosted by {}", info.display_name, info.controller_display_name);
        self.runtime
            .block_on(self.manager.join_session(&info))
            .map_err(CoreError::from)
    }

    pub fn leave_session(&self) {
        self.runtime.block_on(self.manager.leave_session());
    }

    /// Share the scrub position. Never fails.
    pub fn send_progress(&self, position: f32) {
        self.runtime.block_on(self.manager.send_progress(position));
    }

    /// Hand the current media over to the other side
    pub fn send_handoff(
        &self,
        card_json: String,
        played_position_ms: u64,
        media_url: String,
    ) -> Result<(), CoreError> {
        let position = Duration::from_millis(played_position_ms);
        self.runtime
            .block_on(self.manager.send_handoff(card_json, position, media_url))
            .map_err(CoreError::from)
    }

    /// Ask the other side to hand its media over
    pub fn request_media(&self) -> Result<(), CoreError> {
        self.runtime
            .block_on(self.manager.request_media())
            .map_err(CoreError::from)
    }

    /// Dial a peer directly when mDNS is unavailable
    pub fn dial_peer(&self, multiaddr: String) -> Result<(), CoreError> {
        self.network.dial_peer(&multiaddr).map_err(CoreError::from)
    }

    pub fn local_peer_id(&self) -> String {
        self.network.local_peer_id.clone()
    }

    /// Tear everything down. The session cannot be used afterwards.
    pub fn shutdown(&self) {
        info!("Shutting down handoff session");
        self.runtime.block_on(self.manager.shutdown());
        self.network.shutdown();
    }
}

impl HandoffSession {
    pub fn with_config(config: NetworkConfig) -> Result<Self, CoreError> {
        init_tracing();
        info!("Initializing handoff-core session for {}", config.device_name);

        let runtime = Runtime::new()
            .map_err(|e| CoreError::NetworkError(format!("Failed to create tokio runtime: {}", e)))?;

        let network = {
            let _guard = runtime.enter();
            NetworkManager::with_config(config).start()?
        };
        debug!("Network started as {}", network.local_peer_id);

        let transport = Arc::new(P2pTransport::new(network.clone()));
        let manager = Arc::new(SessionManager::new(transport, Arc::new(EventHub::new())));
        let callback: SharedCallback = Arc::new(RwLock::new(None));
        let subscriptions = forward_events(&manager, &callback);

        Ok(Self {
            runtime,
            manager,
            network,
            callback,
            subscriptions: Mutex::new(subscriptions),
        })
    }
}

impl Drop for HandoffSession {
    fn drop(&mut self) {
        let hub = self.manager.hub();
        for subscription in self.subscriptions.lock().drain(..) {
            hub.unsubscribe(subscription);
        }
        if self.manager.phase().is_active() {
            warn!("Handoff session dropped while a session was active");
        }
        self.network.shutdown();
    }
}
