//! Session Manager
//!
//! Creates or joins at most one session at a time, binds the sync channel to
//! it and forwards inbound messages to the event hub.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::state::{ActiveSession, SessionPhase, SessionRole, SessionSnapshot};
use super::{SessionConfig, SessionError};
use crate::events::EventHub;
use crate::sync::{dispatch_frame, Discovery, HandoffPayload, RemoteSessionInfo, SyncMessage};
use crate::transport::{
    AccessStatus, Channel, InboundFrame, JoinRequest, Session, SessionController, Transport,
    TransportError,
};

/// A session that has been created or joined but has no channel yet
struct PendingSession {
    role: SessionRole,
    session: Arc<dyn Session>,
    controller: Option<Box<dyn SessionController>>,
    join_pump: Option<JoinHandle<()>>,
}

impl PendingSession {
    fn discard(self) {
        if let Some(pump) = self.join_pump {
            pump.abort();
        }
        self.session.dispose();
    }
}

/// Main session manager
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    hub: Arc<EventHub>,
    config: SessionConfig,
    discovery: Discovery,
    phase: RwLock<SessionPhase>,
    /// Held for the whole of a create, join or release
    active: Mutex<Option<ActiveSession>>,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    current: RwLock<Option<SessionSnapshot>>,
    /// Bumped on every release; dispatch loops from older generations stop
    dispatch_gate: Arc<RwLock<u64>>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, hub: Arc<EventHub>) -> Self {
        Self::with_config(transport, hub, SessionConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, hub: Arc<EventHub>, config: SessionConfig) -> Self {
        let discovery = Discovery::new(Arc::clone(&transport), Arc::clone(&hub));
        Self {
            transport,
            hub,
            config,
            discovery,
            phase: RwLock::new(SessionPhase::Idle),
            active: Mutex::new(None),
            channel: RwLock::new(None),
            current: RwLock::new(None),
            dispatch_gate: Arc::new(RwLock::new(0)),
        }
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.read()
    }

    /// The session we are hosting or have joined, if any
    pub fn current_session(&self) -> Option<SessionSnapshot> {
        self.current.read().clone()
    }

    /// Remote sessions currently in the directory
    pub fn sessions(&self) -> Vec<RemoteSessionInfo> {
        self.discovery.sessions()
    }

    pub fn find_session(&self, session_id: &str) -> Option<RemoteSessionInfo> {
        self.discovery.find_session(session_id)
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Start (or restart) watching for remote sessions
    pub async fn start_discovery(&self) -> Result<(), SessionError> {
        if self.phase() == SessionPhase::Closed {
            return Err(SessionError::Closed);
        }
        self.discovery.start().await.map_err(SessionError::from_discovery)
    }

    pub async fn stop_discovery(&self) {
        self.discovery.stop().await;
    }

    pub async fn is_discovering(&self) -> bool {
        self.discovery.is_running().await
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Host a new session, replacing any current one
    pub async fn create_session(&self, display_name: &str) -> Result<(), SessionError> {
        let mut active = self.active.lock().await;
        let previous = self.begin_attempt()?;
        self.check_access(previous).await?;

        let display_name = if display_name.trim().is_empty() {
            self.config.default_session_name.as_str()
        } else {
            display_name
        };

        self.set_phase(SessionPhase::Hosting);
        let controller = self.transport.create_controller(display_name);
        let join_pump = controller
            .join_requests()
            .map(|requests| spawn_join_pump(requests, Arc::clone(&self.hub)));

        let session = match controller.create_session().await {
            Ok(session) => session,
            Err(e) => {
                if let Some(pump) = join_pump {
                    pump.abort();
                }
                self.set_phase(previous);
                self.hub.publish_status(&format!("Create Session Failed: {}", e));
                return Err(SessionError::CreateFailed(e.to_string()));
            }
        };

        self.hub.publish_status(&format!(
            "Create Session Success: {} {} {}",
            session.controller_display_name(),
            session.display_name(),
            session.id()
        ));

        let pending = PendingSession {
            role: SessionRole::Host,
            session,
            controller: Some(controller),
            join_pump,
        };
        self.install(&mut active, pending)
            .await
            .map_err(|e| SessionError::CreateFailed(e.to_string()))
    }

    /// Join a remote session, replacing any current one
    pub async fn join_session(&self, info: &RemoteSessionInfo) -> Result<(), SessionError> {
        let mut active = self.active.lock().await;
        let previous = self.begin_attempt()?;
        self.check_access(previous).await?;

        self.set_phase(SessionPhase::Joining);
        let session = match self.transport.join(info).await {
            Ok(session) => session,
            Err(e) => {
                self.set_phase(previous);
                self.hub.publish_status(&format!(
                    "Join Session Failed: {} {}",
                    info.display_name, e
                ));
                return Err(SessionError::JoinFailed(e.to_string()));
            }
        };

        self.hub.publish_status(&format!(
            "Join Session Success: {} {}",
            session.display_name(),
            session.controller_display_name()
        ));

        let pending = PendingSession {
            role: SessionRole::Guest,
            session,
            controller: None,
            join_pump: None,
        };
        self.install(&mut active, pending)
            .await
            .map_err(|e| SessionError::JoinFailed(e.to_string()))
    }

    /// Join a session picked from the directory by id
    pub async fn join_session_by_id(&self, session_id: &str) -> Result<(), SessionError> {
        let info = self
            .discovery
            .find_session(session_id)
            .ok_or_else(|| SessionError::JoinFailed(format!("no session with id {}", session_id)))?;
        self.join_session(&info).await
    }

    /// Leave or stop hosting the current session
    pub async fn leave_session(&self) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.release(previous);
        }
        let mut phase = self.phase.write();
        if *phase != SessionPhase::Closed {
            *phase = SessionPhase::Idle;
        }
    }

    /// Tear everything down. The manager cannot be reused afterwards.
    pub async fn shutdown(&self) {
        {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.take() {
                self.release(previous);
            }
            self.set_phase(SessionPhase::Closed);
        }
        self.discovery.stop().await;
        info!("Session manager shut down");
    }

    // ========================================================================
    // Sends
    // ========================================================================

    /// Share the playback position. Best effort: failures are only logged.
    pub async fn send_progress(&self, drag_position: f32) {
        let Some(channel) = self.current_channel() else {
            return;
        };
        let envelope = SyncMessage::PositionData { drag_position }.to_envelope();
        if let Err(e) = channel.send(envelope).await {
            debug!("Progress update dropped: {}", e);
        }
    }

    /// Hand the media off to the other side of the session
    pub async fn send_handoff(
        &self,
        card_json: impl Into<String>,
        played_position: Duration,
        media_url: impl Into<String>,
    ) -> Result<(), SessionError> {
        let payload = HandoffPayload::new(card_json, played_position, media_url);
        self.send_message(SyncMessage::MediaData(payload)).await
    }

    /// Ask the other side to hand its media over
    pub async fn request_media(&self) -> Result<(), SessionError> {
        self.send_message(SyncMessage::RequestMedia).await
    }

    async fn send_message(&self, message: SyncMessage) -> Result<(), SessionError> {
        let Some(channel) = self.current_channel() else {
            debug!("No channel open, not sending {}", message.type_name());
            return Ok(());
        };
        channel.send(message.to_envelope()).await.map_err(|e| {
            warn!("Failed to send {}: {}", message.type_name(), e);
            SessionError::SendFailed(e.to_string())
        })
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn current_channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.read().clone()
    }

    fn set_phase(&self, next: SessionPhase) {
        let mut phase = self.phase.write();
        if *phase != next {
            debug!("Session phase {:?} -> {:?}", *phase, next);
            *phase = next;
        }
    }

    /// Enter `Requesting`, returning the phase to restore if the attempt fails
    fn begin_attempt(&self) -> Result<SessionPhase, SessionError> {
        let mut phase = self.phase.write();
        if *phase == SessionPhase::Closed {
            return Err(SessionError::Closed);
        }
        let previous = *phase;
        *phase = SessionPhase::Requesting;
        Ok(previous)
    }

    async fn check_access(&self, restore: SessionPhase) -> Result<(), SessionError> {
        if self.transport.request_access().await == AccessStatus::Denied {
            self.set_phase(restore);
            self.hub.publish_status("Access to remote sessions denied");
            return Err(SessionError::AccessDenied);
        }
        Ok(())
    }

    /// Swap in a new session: the old one is torn down before the new
    /// channel opens.
    async fn install(
        &self,
        active: &mut Option<ActiveSession>,
        pending: PendingSession,
    ) -> Result<(), TransportError> {
        if let Some(previous) = active.take() {
            self.release(previous);
        }

        let opened = self
            .transport
            .open_channel(&pending.session, &self.config.channel_name)
            .await;
        let endpoint = match opened {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("Failed to open channel {}: {}", self.config.channel_name, e);
                pending.discard();
                self.set_phase(SessionPhase::Idle);
                return Err(e);
            }
        };

        let generation = *self.dispatch_gate.read();
        let dispatch = tokio::spawn(dispatch_frames(
            endpoint.frames,
            generation,
            Arc::clone(&self.dispatch_gate),
            Arc::clone(&self.hub),
        ));

        let session = ActiveSession {
            role: pending.role,
            session: pending.session,
            channel: Arc::clone(&endpoint.channel),
            dispatch,
            join_pump: pending.join_pump,
            controller: pending.controller,
        };
        let snapshot = session.snapshot();
        info!("Session {} active as {:?}", snapshot.session_id, snapshot.role);

        *self.current.write() = Some(snapshot);
        *self.channel.write() = Some(endpoint.channel);
        *active = Some(session);
        self.set_phase(SessionPhase::Active);
        Ok(())
    }

    fn release(&self, previous: ActiveSession) {
        // Waits out any handler running under the read side
        *self.dispatch_gate.write() += 1;
        *self.channel.write() = None;
        *self.current.write() = None;

        let session_id = previous.session.id().to_string();
        drop(previous);
        self.hub.publish_status(&format!("Session Closed {}", session_id));
    }
}

fn spawn_join_pump(mut requests: mpsc::UnboundedReceiver<JoinRequest>, hub: Arc<EventHub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            hub.publish_status(&format!("Join Requested {}", request.participant()));
            request.accept();
        }
    })
}

async fn dispatch_frames(
    mut frames: mpsc::UnboundedReceiver<InboundFrame>,
    generation: u64,
    gate: Arc<RwLock<u64>>,
    hub: Arc<EventHub>,
) {
    while let Some(frame) = frames.recv().await {
        if !dispatch_if_current(&gate, generation, &frame, &hub) {
            break;
        }
    }
    debug!("Channel dispatch {} ended", generation);
}

fn dispatch_if_current(gate: &RwLock<u64>, generation: u64, frame: &InboundFrame, hub: &EventHub) -> bool {
    let current = gate.read();
    if *current != generation {
        return false;
    }
    // Malformed frames are reported by dispatch_frame, the loop keeps going
    let _ = dispatch_frame(frame, hub);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Envelope;
    use crate::transport::memory::{MemoryNetwork, MemoryTransport, NetworkLogEntry};
    use tokio::time::timeout;

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("hub alive")
    }

    fn manager(device: &Arc<MemoryTransport>) -> SessionManager {
        SessionManager::new(device.clone(), Arc::new(EventHub::new()))
    }

    fn progress_events(hub: &EventHub) -> mpsc::UnboundedReceiver<f32> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.subscribe_progress(move |value| {
            let _ = tx.send(value);
        });
        rx
    }

    fn handoff_events(hub: &EventHub) -> mpsc::UnboundedReceiver<HandoffPayload> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.subscribe_handoff(move |payload| {
            let _ = tx.send(payload.clone());
        });
        rx
    }

    fn status_events(hub: &EventHub) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.subscribe_status(move |line| {
            let _ = tx.send(line.to_string());
        });
        rx
    }

    fn position(log: &[NetworkLogEntry], entry: &NetworkLogEntry) -> usize {
        log.iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{:?} not in log", entry))
    }

    #[tokio::test]
    async fn test_create_session_goes_active() {
        let network = MemoryNetwork::new();
        let tv = network.device("Living Room");
        let manager = manager(&tv);

        manager.create_session("Movie Night").await.unwrap();

        assert_eq!(manager.phase(), SessionPhase::Active);
        let current = manager.current_session().unwrap();
        assert_eq!(current.role, SessionRole::Host);
        assert_eq!(current.display_name, "Movie Night");
        assert_eq!(current.controller_display_name, "Living Room");
        assert_eq!(network.channel_count(&current.session_id), 1);
        assert_eq!(network.advertised().len(), 1);
    }

    #[tokio::test]
    async fn test_blank_name_uses_default() {
        let network = MemoryNetwork::new();
        let tv = network.device("tv");
        let manager = manager(&tv);

        manager.create_session("  ").await.unwrap();

        assert_eq!(manager.current_session().unwrap().display_name, "Connected Experience");
    }

    #[tokio::test]
    async fn test_second_create_disposes_first_before_opening() {
        let network = MemoryNetwork::new();
        let tv = network.device("tv");
        let manager = manager(&tv);

        manager.create_session("first").await.unwrap();
        let first = manager.current_session().unwrap().session_id;
        manager.create_session("second").await.unwrap();
        let second = manager.current_session().unwrap().session_id;
        assert_ne!(first, second);

        let log = network.log();
        let disposed = position(
            &log,
            &NetworkLogEntry::SessionDisposed { session_id: first.clone(), device: "tv".into() },
        );
        let opened = position(
            &log,
            &NetworkLogEntry::ChannelOpened { session_id: second.clone(), device: "tv".into() },
        );
        assert!(disposed < opened);

        assert_eq!(network.channel_count(&first), 0);
        assert_eq!(network.channel_count(&second), 1);
        let advertised = network.advertised();
        assert_eq!(advertised.len(), 1);
        assert_eq!(advertised[0].session_id, second);
    }

    #[tokio::test]
    async fn test_concurrent_creates_leave_one_session() {
        let network = MemoryNetwork::new();
        let tv = network.device("tv");
        let manager = manager(&tv);

        let (a, b) = tokio::join!(manager.create_session("a"), manager.create_session("b"));
        a.unwrap();
        b.unwrap();

        let live: usize = network
            .log()
            .iter()
            .filter_map(|e| match e {
                NetworkLogEntry::SessionCreated { session_id, .. } => Some(session_id.clone()),
                _ => None,
            })
            .map(|id| network.channel_count(&id))
            .sum();
        assert_eq!(live, 1);
        assert_eq!(manager.phase(), SessionPhase::Active);
    }

    #[tokio::test]
    async fn test_handoff_end_to_end() {
        let network = MemoryNetwork::new();
        let tv = network.device("tv");
        let phone = network.device("phone");
        let host = manager(&tv);
        let guest = manager(&phone);

        let mut host_status = status_events(host.hub());
        let mut host_progress = progress_events(host.hub());
        let mut guest_handoffs = handoff_events(guest.hub());
        let (media_tx, mut media_rx) = mpsc::unbounded_channel();
        host.hub().subscribe_media_requested(move || {
            let _ = media_tx.send(());
        });

        host.create_session("Movie Night").await.unwrap();
        let info = network.advertised()[0].clone();
        guest.join_session(&info).await.unwrap();
        assert_eq!(guest.current_session().unwrap().role, SessionRole::Guest);

        let mut saw_join = false;
        while let Ok(Some(line)) = timeout(Duration::from_millis(200), host_status.recv()).await {
            if line == "Join Requested phone" {
                saw_join = true;
                break;
            }
        }
        assert!(saw_join);

        guest.send_progress(0.25).await;
        assert_eq!(recv(&mut host_progress).await, 0.25);

        host.send_handoff("{\"type\":\"AdaptiveCard\"}", Duration::from_secs(83), "https://media/clip.mp4")
            .await
            .unwrap();
        let payload = recv(&mut guest_handoffs).await;
        assert_eq!(payload.card_json, "{\"type\":\"AdaptiveCard\"}");
        assert_eq!(payload.played_position, Duration::from_secs(83));
        assert_eq!(payload.media_url, "https://media/clip.mp4");

        guest.request_media().await.unwrap();
        recv(&mut media_rx).await;
    }

    #[tokio::test]
    async fn test_join_from_directory_by_id() {
        let network = MemoryNetwork::new();
        let tv = network.device("tv");
        let phone = network.device("phone");
        let host = manager(&tv);
        let guest = manager(&phone);

        host.create_session("Movie Night").await.unwrap();

        let (tx, mut changes) = mpsc::unbounded_channel();
        guest.hub().subscribe_directory_changed(move || {
            let _ = tx.send(());
        });
        guest.start_discovery().await.unwrap();
        recv(&mut changes).await;

        let sessions = guest.sessions();
        assert_eq!(sessions.len(), 1);
        guest.join_session_by_id(&sessions[0].session_id).await.unwrap();
        assert_eq!(guest.phase(), SessionPhase::Active);

        let missing = guest.join_session_by_id("nope").await;
        assert!(matches!(missing, Err(SessionError::JoinFailed(_))));
    }

    #[tokio::test]
    async fn test_replaced_session_stops_dispatching() {
        let network = MemoryNetwork::new();
        let tv = network.device("tv");
        let phone = network.device("phone");
        let host = manager(&tv);
        let guest = manager(&phone);

        host.create_session("A").await.unwrap();
        let a = network.advertised()[0].clone();
        guest.join_session(&a).await.unwrap();

        let mut guest_progress = progress_events(guest.hub());
        guest.create_session("B").await.unwrap();

        let log = network.log();
        position(
            &log,
            &NetworkLogEntry::SessionDisposed { session_id: a.session_id.clone(), device: "phone".into() },
        );

        // Only the host is left on A
        assert_eq!(network.channel_count(&a.session_id), 1);
        host.send_progress(0.9).await;
        let envelope = SyncMessage::PositionData { drag_position: 0.5 }.to_envelope();
        assert_eq!(network.inject_frame(&a.session_id, "Media", "tv", envelope), 1);

        let late = timeout(Duration::from_millis(100), guest_progress.recv()).await;
        assert!(late.is_err());
    }

    #[tokio::test]
    async fn test_sends_without_channel_are_noops() {
        let network = MemoryNetwork::new();
        let tv = network.device("tv");
        let manager = manager(&tv);

        manager.send_progress(0.5).await;
        manager.send_handoff("{}", Duration::ZERO, "u").await.unwrap();
        manager.request_media().await.unwrap();

        assert_eq!(tv.send_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failures() {
        let network = MemoryNetwork::new();
        let tv = network.device("tv");
        let manager = manager(&tv);
        manager.create_session("A").await.unwrap();
        tv.set_fail_sends(true);

        // Progress is fire and forget
        manager.send_progress(0.5).await;
        let result = manager.send_handoff("{}", Duration::from_secs(1), "u").await;
        assert!(matches!(result, Err(SessionError::SendFailed(_))));
        assert!(matches!(manager.request_media().await, Err(SessionError::SendFailed(_))));
        assert_eq!(tv.send_count(), 3);
        assert_eq!(manager.phase(), SessionPhase::Active);
    }

    #[tokio::test]
    async fn test_access_denied_restores_phase() {
        let network = MemoryNetwork::new();
        let tv = network.device("tv");
        let manager = manager(&tv);

        tv.set_access(AccessStatus::Denied);
        let result = manager.create_session("A").await;
        assert!(matches!(result, Err(SessionError::AccessDenied)));
        assert_eq!(manager.phase(), SessionPhase::Idle);
        assert!(network.log().is_empty());

        tv.set_access(AccessStatus::Granted);
        manager.create_session("A").await.unwrap();
        let id = manager.current_session().unwrap().session_id;

        tv.set_access(AccessStatus::Denied);
        let info = RemoteSessionInfo::new("x", "device-x", "X", "x");
        assert!(matches!(manager.join_session(&info).await, Err(SessionError::AccessDenied)));
        assert_eq!(manager.phase(), SessionPhase::Active);
        assert_eq!(network.channel_count(&id), 1);
    }

    #[tokio::test]
    async fn test_create_failure_keeps_current_session() {
        let network = MemoryNetwork::new();
        let tv = network.device("tv");
        let manager = manager(&tv);
        manager.create_session("A").await.unwrap();
        let id = manager.current_session().unwrap().session_id;

        tv.set_fail_create(true);
        let result = manager.create_session("B").await;
        assert!(matches!(result, Err(SessionError::CreateFailed(_))));
        assert_eq!(manager.phase(), SessionPhase::Active);
        assert_eq!(manager.current_session().unwrap().session_id, id);
        assert_eq!(network.channel_count(&id), 1);
    }

    #[tokio::test]
    async fn test_join_failure_restores_phase() {
        let network = MemoryNetwork::new();
        let phone = network.device("phone");
        let manager = manager(&phone);

        let info = RemoteSessionInfo::new("gone", "device-9", "Gone", "nobody");
        let result = manager.join_session(&info).await;
        assert!(matches!(result, Err(SessionError::JoinFailed(_))));
        assert_eq!(manager.phase(), SessionPhase::Idle);
        assert!(manager.current_session().is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_stop_dispatch() {
        let network = MemoryNetwork::new();
        let tv = network.device("tv");
        let manager = manager(&tv);
        let mut progress = progress_events(manager.hub());
        manager.create_session("A").await.unwrap();
        let id = manager.current_session().unwrap().session_id;

        let bad = Envelope::new().with("Type", "PositionData").with("DragPosition", "fast");
        network.inject_frame(&id, "Media", "phone", bad);
        let good = SyncMessage::PositionData { drag_position: 0.75 }.to_envelope();
        network.inject_frame(&id, "Media", "phone", good);

        assert_eq!(recv(&mut progress).await, 0.75);
    }

    #[tokio::test]
    async fn test_leave_session() {
        let network = MemoryNetwork::new();
        let tv = network.device("tv");
        let manager = manager(&tv);
        manager.create_session("A").await.unwrap();
        let id = manager.current_session().unwrap().session_id;

        manager.leave_session().await;

        assert_eq!(manager.phase(), SessionPhase::Idle);
        assert!(manager.current_session().is_none());
        assert_eq!(network.channel_count(&id), 0);
        assert!(network.advertised().is_empty());

        // Nothing to leave
        manager.leave_session().await;
        assert_eq!(manager.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_is_final() {
        let network = MemoryNetwork::new();
        let tv = network.device("tv");
        let manager = manager(&tv);
        manager.start_discovery().await.unwrap();
        manager.create_session("A").await.unwrap();

        manager.shutdown().await;

        assert_eq!(manager.phase(), SessionPhase::Closed);
        assert_eq!(network.watcher_count(), 0);
        assert!(!manager.is_discovering().await);
        assert!(matches!(manager.create_session("B").await, Err(SessionError::Closed)));
        assert!(matches!(manager.start_discovery().await, Err(SessionError::Closed)));

        manager.leave_session().await;
        assert_eq!(manager.phase(), SessionPhase::Closed);
    }
}
