//! Event hub to callback forwarding

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::events::Subscription;
use crate::session::SessionManager;

use super::types::{HandoffCallback, HandoffInfo, SessionInfo};

pub(super) type SharedCallback = Arc<RwLock<Option<Arc<dyn HandoffCallback>>>>;

/// Run `f` against the installed callback, if any, without holding the lock
fn with_callback(callback: &SharedCallback, f: impl FnOnce(&dyn HandoffCallback)) {
    let installed = callback.read().clone();
    if let Some(cb) = installed {
        f(cb.as_ref());
    }
}

/// Subscribe to every hub stream and forward it to `callback`
pub(super) fn forward_events(manager: &Arc<SessionManager>, callback: &SharedCallback) -> Vec<Subscription> {
    let hub = manager.hub();
    let mut subscriptions = Vec::with_capacity(5);

    let cb = Arc::clone(callback);
    subscriptions.push(hub.subscribe_status(move |line| {
        let line = line.to_string();
        with_callback(&cb, move |c| c.on_status(line));
    }));

    let cb = Arc::clone(callback);
    let weak = Arc::downgrade(manager);
    subscriptions.push(hub.subscribe_directory_changed(move || {
        let Some(manager) = weak.upgrade() else {
            return;
        };
        let sessions: Vec<SessionInfo> = manager.sessions().iter().map(SessionInfo::from).collect();
        debug!("Directory now has {} sessions", sessions.len());
        with_callback(&cb, move |c| c.on_sessions_changed(sessions));
    }));

    let cb = Arc::clone(callback);
    subscriptions.push(hub.subscribe_progress(move |position| {
        with_callback(&cb, |c| c.on_progress(position));
    }));

    let cb = Arc::clone(callback);
    subscriptions.push(hub.subscribe_handoff(move |payload| {
        let handoff = HandoffInfo::from(payload);
        with_callback(&cb, move |c| c.on_handoff(handoff));
    }));

    let cb = Arc::clone(callback);
    subscriptions.push(hub.subscribe_media_requested(move || {
        with_callback(&cb, |c| c.on_media_requested());
    }));

    subscriptions
}
