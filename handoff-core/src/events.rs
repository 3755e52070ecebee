//! Event Hub
//!
//! Fan-out point for everything consumers (UI code, bindings) observe:
//! status lines, directory changes, scrub progress, handoffs and media
//! requests. One hub is created per manager and handed to whoever needs it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::sync::HandoffPayload;

/// Which stream a subscription belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Status,
    DirectoryChanged,
    Progress,
    Handoff,
    MediaRequested,
}

/// Handle returned by the `subscribe_*` methods, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listeners<T: ?Sized> {
    entries: RwLock<Vec<(u64, Handler<T>)>>,
}

impl<T: ?Sized> Listeners<T> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, id: u64, handler: Handler<T>) {
        self.entries.write().push((id, handler));
    }

    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Invoke a snapshot of the handlers. The lock is released before any
    /// handler runs, so handlers may subscribe or unsubscribe.
    fn emit(&self, value: &T) {
        let snapshot: Vec<Handler<T>> = self
            .entries
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in snapshot {
            handler(value);
        }
    }
}

/// Publish/subscribe hub for session events
pub struct EventHub {
    next_id: AtomicU64,
    status: Listeners<str>,
    directory_changed: Listeners<()>,
    progress: Listeners<f32>,
    handoff: Listeners<HandoffPayload>,
    media_requested: Listeners<()>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            status: Listeners::new(),
            directory_changed: Listeners::new(),
            progress: Listeners::new(),
            handoff: Listeners::new(),
            media_requested: Listeners::new(),
        }
    }

    fn subscription(&self, kind: EventKind) -> Subscription {
        Subscription {
            kind,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn subscribe_status<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let sub = self.subscription(EventKind::Status);
        self.status.add(sub.id, Arc::new(handler));
        sub
    }

    pub fn subscribe_directory_changed<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let sub = self.subscription(EventKind::DirectoryChanged);
        self.directory_changed.add(sub.id, Arc::new(move |_: &()| handler()));
        sub
    }

    pub fn subscribe_progress<F>(&self, handler: F) -> Subscription
    where
        F: Fn(f32) + Send + Sync + 'static,
    {
        let sub = self.subscription(EventKind::Progress);
        self.progress.add(sub.id, Arc::new(move |value: &f32| handler(*value)));
        sub
    }

    pub fn subscribe_handoff<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&HandoffPayload) + Send + Sync + 'static,
    {
        let sub = self.subscription(EventKind::Handoff);
        self.handoff.add(sub.id, Arc::new(handler));
        sub
    }

    pub fn subscribe_media_requested<F>(&self, handler: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let sub = self.subscription(EventKind::MediaRequested);
        self.media_requested.add(sub.id, Arc::new(move |_: &()| handler()));
        sub
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        match subscription.kind {
            EventKind::Status => self.status.remove(subscription.id),
            EventKind::DirectoryChanged => self.directory_changed.remove(subscription.id),
            EventKind::Progress => self.progress.remove(subscription.id),
            EventKind::Handoff => self.handoff.remove(subscription.id),
            EventKind::MediaRequested => self.media_requested.remove(subscription.id),
        }
    }

    /// Number of live subscribers for an event kind
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::Status => self.status.len(),
            EventKind::DirectoryChanged => self.directory_changed.len(),
            EventKind::Progress => self.progress.len(),
            EventKind::Handoff => self.handoff.len(),
            EventKind::MediaRequested => self.media_requested.len(),
        }
    }

    /// Publish a human-readable status line (also written to the log)
    pub fn publish_status(&self, message: &str) {
        info!("{}", message);
        self.status.emit(message);
    }

    pub fn publish_directory_changed(&self) {
        self.directory_changed.emit(&());
    }

    pub fn publish_progress(&self, value: f32) {
        self.progress.emit(&value);
    }

    pub fn publish_handoff(&self, payload: &HandoffPayload) {
        self.handoff.emit(payload);
    }

    pub fn publish_media_requested(&self) {
        self.media_requested.emit(&());
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let hub = EventHub::new();
        hub.publish_status("nobody listening");
        hub.publish_directory_changed();
        hub.publish_progress(0.5);
        hub.publish_media_requested();
        assert_eq!(hub.subscriber_count(EventKind::Progress), 0);
    }

    #[test]
    fn test_fan_out_to_every_subscriber() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            hub.subscribe_progress(move |value| seen.lock().push((tag, value)));
        }

        hub.publish_progress(1.25);
        assert_eq!(*seen.lock(), vec![("a", 1.25), ("b", 1.25)]);
    }

    #[test]
    fn test_unsubscribe() {
        let hub = EventHub::new();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let sub = hub.subscribe_directory_changed(move || *counter.lock() += 1);

        hub.publish_directory_changed();
        assert!(hub.unsubscribe(sub));
        assert!(!hub.unsubscribe(sub));
        hub.publish_directory_changed();

        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_handoff_payload_reaches_subscriber() {
        let hub = EventHub::new();
        let received = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&received);
        hub.subscribe_handoff(move |payload| *slot.lock() = Some(payload.clone()));

        let payload = HandoffPayload::new("{}", Duration::from_secs(3), "https://media/clip.mp4");
        hub.publish_handoff(&payload);

        assert_eq!(received.lock().as_ref(), Some(&payload));
    }

    #[test]
    fn test_reentrant_subscribe_and_unsubscribe() {
        let hub = Arc::new(EventHub::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let own_sub = Arc::new(Mutex::new(None));

        let hub_in_handler = Arc::clone(&hub);
        let calls_in_handler = Arc::clone(&calls);
        let own_sub_in_handler = Arc::clone(&own_sub);
        let sub = hub.subscribe_status(move |message| {
            calls_in_handler.lock().push(format!("first:{message}"));

            // Drop ourselves and register a replacement mid-publish
            if let Some(sub) = own_sub_in_handler.lock().take() {
                hub_in_handler.unsubscribe(sub);
            }
            let calls = Arc::clone(&calls_in_handler);
            hub_in_handler.subscribe_status(move |message| calls.lock().push(format!("second:{message}")));
        });
        *own_sub.lock() = Some(sub);

        hub.publish_status("one");
        hub.publish_status("two");

        assert_eq!(*calls.lock(), vec!["first:one".to_string(), "second:two".to_string()]);
        assert_eq!(hub.subscriber_count(EventKind::Status), 1);
    }
}
