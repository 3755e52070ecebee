//! Session Directory
//!
//! Tracks the remote sessions we can currently see, one entry per
//! controller, and drives the discovery watcher that feeds it.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::events::EventHub;
use crate::transport::{AccessStatus, DiscoveryEvent, DiscoveryWatcher, Transport, TransportError};

/// A remote session advertised by another device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSessionInfo {
    pub session_id: String,
    /// Identity of the device hosting the session
    pub controller_id: String,
    pub display_name: String,
    pub controller_display_name: String,
}

impl RemoteSessionInfo {
    pub fn new(
        session_id: impl Into<String>,
        controller_id: impl Into<String>,
        display_name: impl Into<String>,
        controller_display_name: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            controller_id: controller_id.into(),
            display_name: display_name.into(),
            controller_display_name: controller_display_name.into(),
        }
    }
}

// Identity is the controller: a device advertises at most one session.
impl PartialEq for RemoteSessionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.controller_id == other.controller_id
    }
}

impl Eq for RemoteSessionInfo {}

/// Ordered set of remote sessions keyed by controller id
#[derive(Debug, Clone, Default)]
pub struct SessionDirectory {
    entries: Vec<RemoteSessionInfo>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[RemoteSessionInfo] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, controller_id: &str) -> Option<&RemoteSessionInfo> {
        self.entries.iter().find(|e| e.controller_id == controller_id)
    }

    pub fn find_session(&self, session_id: &str) -> Option<&RemoteSessionInfo> {
        self.entries.iter().find(|e| e.session_id == session_id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Apply one discovery notification
    pub fn apply(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Added(info) => self.insert(info),
            DiscoveryEvent::Removed(info) => {
                self.entries.retain(|e| e != &info);
            }
            DiscoveryEvent::Updated(info) => {
                self.entries.retain(|e| e.controller_id != info.controller_id);
                self.entries.push(info);
            }
        }
    }

    /// Insert, replacing any entry with the same controller id in place
    fn insert(&mut self, info: RemoteSessionInfo) {
        match self.entries.iter_mut().find(|e| e.controller_id == info.controller_id) {
            Some(existing) => *existing = info,
            None => self.entries.push(info),
        }
    }
}

/// Directory contents tagged with the watcher generation that may write it
#[derive(Default)]
struct DirectoryState {
    generation: u64,
    directory: SessionDirectory,
}

struct ActiveWatch {
    watcher: Box<dyn DiscoveryWatcher>,
    pump: JoinHandle<()>,
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        self.watcher.stop();
        self.pump.abort();
    }
}

/// Runs discovery and keeps a [`SessionDirectory`] current
pub struct Discovery {
    transport: Arc<dyn Transport>,
    hub: Arc<EventHub>,
    state: Arc<RwLock<DirectoryState>>,
    watch: Mutex<Option<ActiveWatch>>,
}

impl Discovery {
    pub fn new(transport: Arc<dyn Transport>, hub: Arc<EventHub>) -> Self {
        Self {
            transport,
            hub,
            state: Arc::new(RwLock::new(DirectoryState::default())),
            watch: Mutex::new(None),
        }
    }

    /// Snapshot of the directory
    pub fn sessions(&self) -> Vec<RemoteSessionInfo> {
        self.state.read().directory.entries().to_vec()
    }

    pub fn find_session(&self, session_id: &str) -> Option<RemoteSessionInfo> {
        self.state.read().directory.find_session(session_id).cloned()
    }

    pub async fn is_running(&self) -> bool {
        self.watch.lock().await.is_some()
    }

    /// (Re)start discovery.
    ///
    /// Stops any previous watcher, clears the directory and attaches a new
    /// watcher. Access denial is returned to the caller as-is.
    pub async fn start(&self) -> Result<(), TransportError> {
        let mut watch = self.watch.lock().await;

        if self.transport.request_access().await == AccessStatus::Denied {
            self.hub.publish_status("Discovery access denied");
            return Err(TransportError::AccessDenied);
        }

        // Old watcher must be gone before the new one attaches
        drop(watch.take());

        let (generation, was_empty) = {
            let mut state = self.state.write();
            state.generation += 1;
            let was_empty = state.directory.is_empty();
            state.directory.clear();
            (state.generation, was_empty)
        };
        if !was_empty {
            self.hub.publish_directory_changed();
        }

        let watcher = self.transport.create_discovery_watcher();
        let events = watcher.start()?;
        let pump = tokio::spawn(pump_events(
            events,
            generation,
            Arc::clone(&self.state),
            Arc::clone(&self.hub),
        ));

        *watch = Some(ActiveWatch { watcher, pump });
        debug!("Discovery started (generation {})", generation);
        Ok(())
    }

    /// Stop discovery. Safe to call when not running.
    pub async fn stop(&self) {
        let mut watch = self.watch.lock().await;
        if watch.take().is_some() {
            self.state.write().generation += 1;
            debug!("Discovery stopped");
        }
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    generation: u64,
    state: Arc<RwLock<DirectoryState>>,
    hub: Arc<EventHub>,
) {
    while let Some(event) = events.recv().await {
        let status = match &event {
            DiscoveryEvent::Added(info) => {
                format!("Session Added {}: {}", info.display_name, info.controller_display_name)
            }
            DiscoveryEvent::Removed(info) => format!("Session Removed {}", info.display_name),
            DiscoveryEvent::Updated(info) => format!("Session Updated {}", info.display_name),
        };

        if !apply_if_current(&state, generation, event) {
            break;
        }

        hub.publish_status(&status);
        hub.publish_directory_changed();
    }
    debug!("Discovery pump {} ended", generation);
}

/// Apply an event unless a newer watcher has taken over the directory
fn apply_if_current(state: &RwLock<DirectoryState>, generation: u64, event: DiscoveryEvent) -> bool {
    let mut state = state.write();
    if state.generation != generation {
        return false;
    }
    state.directory.apply(event);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::time::Duration;

    fn info(controller: &str, name: &str) -> RemoteSessionInfo {
        RemoteSessionInfo::new(format!("session-{controller}"), controller, name, format!("device {controller}"))
    }

    #[test]
    fn test_added_replaces_same_controller() {
        let mut dir = SessionDirectory::new();
        dir.apply(DiscoveryEvent::Added(info("1", "first")));
        dir.apply(DiscoveryEvent::Added(info("2", "second")));
        dir.apply(DiscoveryEvent::Added(info("1", "first again")));

        assert_eq!(dir.len(), 2);
        assert_eq!(dir.entries()[0].display_name, "first again");
        assert_eq!(dir.entries()[1].display_name, "second");
    }

    #[test]
    fn test_removed_and_unknown_removal() {
        let mut dir = SessionDirectory::new();
        dir.apply(DiscoveryEvent::Added(info("1", "a")));
        dir.apply(DiscoveryEvent::Removed(info("9", "never seen")));
        assert_eq!(dir.len(), 1);

        dir.apply(DiscoveryEvent::Removed(info("1", "a")));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_updated_is_remove_then_insert() {
        let mut dir = SessionDirectory::new();
        dir.apply(DiscoveryEvent::Added(info("1", "A")));
        dir.apply(DiscoveryEvent::Added(info("2", "B")));
        dir.apply(DiscoveryEvent::Updated(info("1", "A prime")));

        let names: Vec<_> = dir.entries().iter().map(|e| e.display_name.as_str()).collect();
        assert_eq!(names, vec!["B", "A prime"]);
        assert_eq!(dir.get("1").map(|e| e.display_name.as_str()), Some("A prime"));
    }

    #[test]
    fn test_random_sequences_keep_one_entry_per_controller() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..200 {
            let mut dir = SessionDirectory::new();
            let mut expected: HashMap<String, RemoteSessionInfo> = HashMap::new();

            for step in 0..40 {
                let controller = rng.gen_range(0..5).to_string();
                let entry = info(&controller, &format!("name-{step}"));
                match rng.gen_range(0..3) {
                    0 => {
                        expected.insert(controller, entry.clone());
                        dir.apply(DiscoveryEvent::Added(entry));
                    }
                    1 => {
                        expected.remove(&controller);
                        dir.apply(DiscoveryEvent::Removed(entry));
                    }
                    _ => {
                        expected.insert(controller, entry.clone());
                        dir.apply(DiscoveryEvent::Updated(entry));
                    }
                }
            }

            assert_eq!(dir.len(), expected.len());
            for (controller, entry) in &expected {
                let found = dir.get(controller).expect("entry present");
                assert_eq!(found.display_name, entry.display_name);
            }
        }
    }

    async fn next_change(rx: &mut mpsc::UnboundedReceiver<()>) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("directory change in time")
            .expect("hub alive");
    }

    #[tokio::test]
    async fn test_update_scenario_fires_one_change() {
        let network = MemoryNetwork::new();
        let device = network.device("tablet");
        let hub = Arc::new(EventHub::new());
        let discovery = Discovery::new(device, Arc::clone(&hub));

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe_directory_changed(move || {
            let _ = tx.send(());
        });

        discovery.start().await.unwrap();
        network.announce(info("1", "A"));
        network.announce(info("2", "B"));
        next_change(&mut rx).await;
        next_change(&mut rx).await;

        network.update(info("1", "A renamed"));
        next_change(&mut rx).await;

        let sessions = discovery.sessions();
        assert_eq!(sessions.len(), 2);
        let a = sessions.iter().find(|s| s.controller_id == "1").unwrap();
        let b = sessions.iter().find(|s| s.controller_id == "2").unwrap();
        assert_eq!(a.display_name, "A renamed");
        assert_eq!(b.display_name, "B");

        // Exactly one change for the update
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_access_denied_is_surfaced() {
        let network = MemoryNetwork::new();
        let device = network.device("phone");
        device.set_access(AccessStatus::Denied);
        let discovery = Discovery::new(device, Arc::new(EventHub::new()));

        assert!(matches!(discovery.start().await, Err(TransportError::AccessDenied)));
        assert!(!discovery.is_running().await);
    }

    #[tokio::test]
    async fn test_restart_clears_and_drops_old_watcher() {
        let network = MemoryNetwork::new();
        let device = network.device("phone");
        let hub = Arc::new(EventHub::new());
        let discovery = Discovery::new(device, Arc::clone(&hub));

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe_directory_changed(move || {
            let _ = tx.send(());
        });

        discovery.start().await.unwrap();
        network.announce(info("1", "A"));
        next_change(&mut rx).await;
        assert_eq!(network.watcher_count(), 1);

        discovery.start().await.unwrap();
        assert_eq!(network.watcher_count(), 1);
        // The clear itself is a change, then the new watcher replays A
        next_change(&mut rx).await;
        next_change(&mut rx).await;
        assert_eq!(discovery.sessions(), vec![info("1", "A")]);

        network.announce(info("2", "B"));
        next_change(&mut rx).await;
        assert_eq!(discovery.sessions().len(), 2);

        // No duplicate notification from a stale watcher
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let network = MemoryNetwork::new();
        let discovery = Discovery::new(network.device("phone"), Arc::new(EventHub::new()));

        discovery.stop().await;
        discovery.start().await.unwrap();
        discovery.stop().await;
        discovery.stop().await;

        assert!(!discovery.is_running().await);
        assert_eq!(network.watcher_count(), 0);
    }
}
