//! In-process transport
//!
//! Simulates a small network of devices inside one process: sessions
//! advertised by one device show up in every other device's watchers,
//! joins go through the host controller's join queue, and channel frames
//! are broadcast to the other members of the same session channel.
//! Used by the tests and handy for demos without a real network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{
    AccessStatus, Channel, ChannelEndpoint, DiscoveryEvent, DiscoveryWatcher, InboundFrame,
    JoinRequest, Session, SessionController, Transport, TransportError,
};
use crate::sync::{Envelope, RemoteSessionInfo};

/// Observable lifecycle events, recorded in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkLogEntry {
    SessionCreated { session_id: String, device: String },
    SessionJoined { session_id: String, device: String },
    SessionDisposed { session_id: String, device: String },
    ChannelOpened { session_id: String, device: String },
    ChannelClosed { session_id: String, device: String },
}

struct ChannelMember {
    id: u64,
    session_id: String,
    channel: String,
    frames: mpsc::UnboundedSender<InboundFrame>,
}

#[derive(Default)]
struct NetworkState {
    next_id: u64,
    advertised: Vec<RemoteSessionInfo>,
    join_queues: HashMap<String, mpsc::UnboundedSender<JoinRequest>>,
    watchers: Vec<(u64, mpsc::UnboundedSender<DiscoveryEvent>)>,
    members: Vec<ChannelMember>,
    log: Vec<NetworkLogEntry>,
}

impl NetworkState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn notify(&mut self, event: DiscoveryEvent) {
        self.watchers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    fn deliver(
        &self,
        session_id: &str,
        channel: &str,
        exclude: Option<u64>,
        sender: &str,
        envelope: &Envelope,
    ) -> usize {
        let mut delivered = 0;
        for member in &self.members {
            if member.session_id != session_id || member.channel != channel || Some(member.id) == exclude {
                continue;
            }
            let frame = InboundFrame {
                sender: sender.to_string(),
                envelope: envelope.clone(),
            };
            if member.frames.send(frame).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// A simulated network shared by every device created from it
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a device attached to this network
    pub fn device(&self, name: &str) -> Arc<MemoryTransport> {
        let id = self.state.lock().next_id();
        Arc::new(MemoryTransport {
            network: self.clone(),
            device: Arc::new(Device {
                id: format!("device-{id}"),
                name: name.to_string(),
                access_granted: AtomicBool::new(true),
                fail_sends: AtomicBool::new(false),
                fail_create: AtomicBool::new(false),
                sends: AtomicUsize::new(0),
            }),
        })
    }

    /// Advertise a session as if a remote host had created it
    pub fn announce(&self, info: RemoteSessionInfo) {
        let mut state = self.state.lock();
        match state.advertised.iter_mut().find(|e| e.controller_id == info.controller_id) {
            Some(existing) => *existing = info.clone(),
            None => state.advertised.push(info.clone()),
        }
        state.notify(DiscoveryEvent::Added(info));
    }

    /// Change the details of an advertised session
    pub fn update(&self, info: RemoteSessionInfo) {
        let mut state = self.state.lock();
        state.advertised.retain(|e| e.controller_id != info.controller_id);
        state.advertised.push(info.clone());
        state.notify(DiscoveryEvent::Updated(info));
    }

    /// Stop advertising the session described by `info`
    pub fn withdraw(&self, info: &RemoteSessionInfo) {
        let mut state = self.state.lock();
        let position = state
            .advertised
            .iter()
            .position(|e| e == info && e.session_id == info.session_id);
        if let Some(position) = position {
            let removed = state.advertised.remove(position);
            state.notify(DiscoveryEvent::Removed(removed));
        }
    }

    /// Currently advertised sessions
    pub fn advertised(&self) -> Vec<RemoteSessionInfo> {
        self.state.lock().advertised.clone()
    }

    pub fn watcher_count(&self) -> usize {
        self.state.lock().watchers.len()
    }

    /// Number of open channel endpoints on a session
    pub fn channel_count(&self, session_id: &str) -> usize {
        self.state
            .lock()
            .members
            .iter()
            .filter(|m| m.session_id == session_id)
            .count()
    }

    /// Deliver a raw frame to every member of a session channel.
    /// Returns how many endpoints received it.
    pub fn inject_frame(&self, session_id: &str, channel: &str, sender: &str, envelope: Envelope) -> usize {
        self.state.lock().deliver(session_id, channel, None, sender, &envelope)
    }

    /// Lifecycle events recorded so far
    pub fn log(&self) -> Vec<NetworkLogEntry> {
        self.state.lock().log.clone()
    }
}

struct Device {
    id: String,
    name: String,
    access_granted: AtomicBool,
    fail_sends: AtomicBool,
    fail_create: AtomicBool,
    sends: AtomicUsize,
}

/// One device on a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: MemoryNetwork,
    device: Arc<Device>,
}

impl MemoryTransport {
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn name(&self) -> &str {
        &self.device.name
    }

    pub fn set_access(&self, status: AccessStatus) {
        self.device
            .access_granted
            .store(status == AccessStatus::Granted, Ordering::SeqCst);
    }

    /// Make every channel send from this device fail
    pub fn set_fail_sends(&self, fail: bool) {
        self.device.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make session creation on this device fail
    pub fn set_fail_create(&self, fail: bool) {
        self.device.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Number of channel send attempts made by this device
    pub fn send_count(&self) -> usize {
        self.device.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn request_access(&self) -> AccessStatus {
        if self.device.access_granted.load(Ordering::SeqCst) {
            AccessStatus::Granted
        } else {
            AccessStatus::Denied
        }
    }

    fn create_controller(&self, display_name: &str) -> Box<dyn SessionController> {
        let (join_tx, join_rx) = mpsc::unbounded_channel();
        Box::new(MemoryController {
            network: self.network.clone(),
            device: Arc::clone(&self.device),
            display_name: display_name.to_string(),
            join_tx,
            join_rx: Mutex::new(Some(join_rx)),
        })
    }

    fn create_discovery_watcher(&self) -> Box<dyn DiscoveryWatcher> {
        let id = self.network.state.lock().next_id();
        Box::new(MemoryWatcher {
            network: self.network.clone(),
            id,
        })
    }

    async fn join(&self, info: &RemoteSessionInfo) -> Result<Arc<dyn Session>, TransportError> {
        let queue = self.network.state.lock().join_queues.get(&info.session_id).cloned();
        let queue = queue
            .ok_or_else(|| TransportError::JoinFailed(format!("session {} not found", info.session_id)))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        queue
            .send(JoinRequest::new(self.device.name.clone(), reply_tx))
            .map_err(|_| TransportError::JoinFailed("host is not taking join requests".to_string()))?;

        match reply_rx.await {
            Ok(true) => {
                self.network.state.lock().log.push(NetworkLogEntry::SessionJoined {
                    session_id: info.session_id.clone(),
                    device: self.device.name.clone(),
                });
                Ok(Arc::new(MemorySession {
                    network: self.network.clone(),
                    info: info.clone(),
                    device: self.device.name.clone(),
                    hosted: false,
                    disposed: AtomicBool::new(false),
                }))
            }
            Ok(false) => Err(TransportError::JoinFailed("join request declined".to_string())),
            Err(_) => Err(TransportError::JoinFailed("host did not answer".to_string())),
        }
    }

    async fn open_channel(
        &self,
        session: &Arc<dyn Session>,
        name: &str,
    ) -> Result<ChannelEndpoint, TransportError> {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.network.state.lock();
            let id = state.next_id();
            state.members.push(ChannelMember {
                id,
                session_id: session.id().to_string(),
                channel: name.to_string(),
                frames: frames_tx,
            });
            state.log.push(NetworkLogEntry::ChannelOpened {
                session_id: session.id().to_string(),
                device: self.device.name.clone(),
            });
            id
        };

        Ok(ChannelEndpoint {
            channel: Arc::new(MemoryChannel {
                network: self.network.clone(),
                device: Arc::clone(&self.device),
                id,
                session_id: session.id().to_string(),
                name: name.to_string(),
                closed: AtomicBool::new(false),
            }),
            frames: frames_rx,
        })
    }
}

struct MemoryController {
    network: MemoryNetwork,
    device: Arc<Device>,
    display_name: String,
    join_tx: mpsc::UnboundedSender<JoinRequest>,
    join_rx: Mutex<Option<mpsc::UnboundedReceiver<JoinRequest>>>,
}

#[async_trait]
impl SessionController for MemoryController {
    fn join_requests(&self) -> Option<mpsc::UnboundedReceiver<JoinRequest>> {
        self.join_rx.lock().take()
    }

    async fn create_session(&self) -> Result<Arc<dyn Session>, TransportError> {
        if self.device.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::CreateFailed("simulated failure".to_string()));
        }

        let info = {
            let mut state = self.network.state.lock();
            let session_id = format!("{}/session-{}", self.device.id, state.next_id());
            state.join_queues.insert(session_id.clone(), self.join_tx.clone());
            state.log.push(NetworkLogEntry::SessionCreated {
                session_id: session_id.clone(),
                device: self.device.name.clone(),
            });
            RemoteSessionInfo::new(session_id, &self.device.id, &self.display_name, &self.device.name)
        };
        self.network.announce(info.clone());
        debug!("Memory session {} created by {}", info.session_id, self.device.name);

        Ok(Arc::new(MemorySession {
            network: self.network.clone(),
            info,
            device: self.device.name.clone(),
            hosted: true,
            disposed: AtomicBool::new(false),
        }))
    }
}

struct MemorySession {
    network: MemoryNetwork,
    info: RemoteSessionInfo,
    /// Device holding this handle
    device: String,
    hosted: bool,
    disposed: AtomicBool,
}

impl Session for MemorySession {
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
            self.network.state.lock().join_queues.remove(&self.info.session_id);
            self.network.withdraw(&self.info);
        }
        self.network.state.lock().log.push(NetworkLogEntry::SessionDisposed {
            session_id: self.info.session_id.clone(),
            device: self.device.clone(),
        });
    }
}

struct MemoryWatcher {
    network: MemoryNetwork,
    id: u64,
}

impl DiscoveryWatcher for MemoryWatcher {
    fn start(&self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.network.state.lock();
        // Report what is already out there, like a fresh scan would
        for info in &state.advertised {
            let _ = tx.send(DiscoveryEvent::Added(info.clone()));
        }
        state.watchers.push((self.id, tx));
        Ok(rx)
    }

    fn stop(&self) {
        self.network.state.lock().watchers.retain(|(id, _)| *id != self.id);
    }
}

struct MemoryChannel {
    network: MemoryNetwork,
    device: Arc<Device>,
    id: u64,
    session_id: String,
    name: String,
    closed: AtomicBool,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.device.sends.fetch_add(1, Ordering::SeqCst);

        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.device.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("simulated failure".to_string()));
        }

        self.network.state.lock().deliver(
            &self.session_id,
            &self.name,
            Some(self.id),
            &self.device.name,
            &envelope,
        );
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.network.state.lock();
        state.members.retain(|m| m.id != self.id);
        state.log.push(NetworkLogEntry::ChannelClosed {
            session_id: self.session_id.clone(),
            device: self.device.name.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncMessage;

    #[tokio::test]
    async fn test_created_session_is_advertised_and_withdrawn() {
        let network = MemoryNetwork::new();
        let hub = network.device("hub");
        let phone = network.device("phone");

        let watcher = phone.create_discovery_watcher();
        let mut events = watcher.start().unwrap();

        let controller = hub.create_controller("Connected Experience");
        let session = controller.create_session().await.unwrap();

        match events.recv().await {
            Some(DiscoveryEvent::Added(info)) => {
                assert_eq!(info.session_id, session.id());
                assert_eq!(info.controller_id, hub.device_id());
                assert_eq!(info.display_name, "Connected Experience");
                assert_eq!(info.controller_display_name, "hub");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        session.dispose();
        session.dispose();
        assert!(matches!(events.recv().await, Some(DiscoveryEvent::Removed(_))));
        assert!(network.advertised().is_empty());

        watcher.stop();
        assert_eq!(network.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_join_waits_for_host_decision() {
        let network = MemoryNetwork::new();
        let hub = network.device("hub");
        let phone = network.device("phone");

        let controller = hub.create_controller("room");
        let mut requests = controller.join_requests().unwrap();
        assert!(controller.join_requests().is_none());
        let session = controller.create_session().await.unwrap();
        let info = network.advertised()[0].clone();

        let host = tokio::spawn(async move {
            let first = requests.recv().await.unwrap();
            assert_eq!(first.participant(), "phone");
            first.decline();
            requests.recv().await.unwrap().accept();
        });

        assert!(matches!(phone.join(&info).await, Err(TransportError::JoinFailed(_))));
        let joined = phone.join(&info).await.unwrap();
        assert_eq!(joined.id(), session.id());
        host.await.unwrap();
    }

    #[tokio::test]
    async fn test_join_unknown_session_fails() {
        let network = MemoryNetwork::new();
        let phone = network.device("phone");
        let info = RemoteSessionInfo::new("nope", "device-x", "gone", "x");
        assert!(matches!(phone.join(&info).await, Err(TransportError::JoinFailed(_))));
    }

    #[tokio::test]
    async fn test_channel_broadcast_skips_sender() {
        let network = MemoryNetwork::new();
        let hub = network.device("hub");
        let phone = network.device("phone");

        let controller = hub.create_controller("room");
        let mut requests = controller.join_requests().unwrap();
        let hosted = controller.create_session().await.unwrap();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                request.accept();
            }
        });
        let joined = phone.join(&network.advertised()[0]).await.unwrap();

        let mut host_end = hub.open_channel(&hosted, "Media").await.unwrap();
        let mut phone_end = phone.open_channel(&joined, "Media").await.unwrap();

        let envelope = SyncMessage::PositionData { drag_position: 0.5 }.to_envelope();
        phone_end.channel.send(envelope.clone()).await.unwrap();

        let frame = host_end.frames.recv().await.unwrap();
        assert_eq!(frame.sender, "phone");
        assert_eq!(frame.envelope, envelope);
        assert!(phone_end.frames.try_recv().is_err());
        assert_eq!(phone.send_count(), 1);

        phone_end.channel.close();
        assert!(matches!(
            phone_end.channel.send(envelope).await,
            Err(TransportError::Closed)
        ));
        assert_eq!(network.channel_count(hosted.id()), 1);
    }
}
