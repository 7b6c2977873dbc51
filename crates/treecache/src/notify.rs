//! Cache listener notifications.
//!
//! Listeners are kept in a single ordered list; the first registered
//! listener is always called first. Events that describe a change fire
//! twice: once with `pre = true` before the change (a listener error vetoes
//! it) and once with `pre = false` after.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::{CacheError, CacheResult};
use crate::fqn::Fqn;
use crate::types::Address;

/// Event delivered to cache listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheEvent {
    /// A node was created.
    NodeCreated {
        /// Created node.
        fqn: Fqn,
        /// True before the change, false after.
        pre: bool,
        /// True if the change originated on this member.
        origin_local: bool,
    },
    /// A node's data changed.
    NodeModified {
        /// Modified node.
        fqn: Fqn,
        /// True before the change, false after.
        pre: bool,
        /// True if the change originated on this member.
        origin_local: bool,
    },
    /// A node was removed.
    NodeRemoved {
        /// Removed node.
        fqn: Fqn,
        /// True before the change, false after.
        pre: bool,
        /// True if the change originated on this member.
        origin_local: bool,
    },
    /// A node was evicted from memory.
    NodeEvicted {
        /// Evicted node.
        fqn: Fqn,
        /// True before the change, false after.
        pre: bool,
        /// True if the change originated on this member.
        origin_local: bool,
    },
    /// A node was loaded back from the backing store.
    NodeActivated {
        /// Activated node.
        fqn: Fqn,
        /// True before the change, false after.
        pre: bool,
    },
    /// A node was written to the backing store before eviction.
    NodePassivated {
        /// Passivated node.
        fqn: Fqn,
        /// True before the change, false after.
        pre: bool,
    },
    /// A node was read.
    NodeVisited {
        /// Visited node.
        fqn: Fqn,
    },
    /// The cache finished starting.
    CacheStarted,
    /// The cache finished stopping.
    CacheStopped,
    /// A new membership view was installed.
    ViewChanged {
        /// Members in view order.
        members: Vec<Address>,
    },
}

impl CacheEvent {
    /// True for the before-the-change half of a paired event.
    pub fn is_pre(&self) -> bool {
        match self {
            CacheEvent::NodeCreated { pre, .. }
            | CacheEvent::NodeModified { pre, .. }
            | CacheEvent::NodeRemoved { pre, .. }
            | CacheEvent::NodeEvicted { pre, .. }
            | CacheEvent::NodeActivated { pre, .. }
            | CacheEvent::NodePassivated { pre, .. } => *pre,
            _ => false,
        }
    }

    /// Node the event is about.
    pub fn fqn(&self) -> Option<&Fqn> {
        match self {
            CacheEvent::NodeCreated { fqn, .. }
            | CacheEvent::NodeModified { fqn, .. }
            | CacheEvent::NodeRemoved { fqn, .. }
            | CacheEvent::NodeEvicted { fqn, .. }
            | CacheEvent::NodeActivated { fqn, .. }
            | CacheEvent::NodePassivated { fqn, .. }
            | CacheEvent::NodeVisited { fqn } => Some(fqn),
            _ => None,
        }
    }
}

/// Receives cache events.
pub trait CacheListener: Send + Sync {
    /// Handles one event. Returning an error from a pre event vetoes the change.
    fn on_event(&self, event: &CacheEvent) -> CacheResult<()>;
}

/// Ordered fan-out of events to registered listeners.
#[derive(Default)]
pub struct Notifier {
    listeners: RwLock<Vec<Arc<dyn CacheListener>>>,
}

impl Notifier {
    /// Creates a notifier with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a listener. Registering the same handle twice is a no-op.
    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Removes a listener. Returns true if it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn CacheListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Delivers `event` to every listener in registration order.
    ///
    /// For pre events the first listener error stops delivery and is
    /// returned as [`CacheError::Vetoed`]. Errors on other events are logged.
    pub fn notify(&self, event: CacheEvent) -> CacheResult<()> {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if let Err(e) = listener.on_event(&event) {
                if event.is_pre() {
                    let fqn = event.fqn().cloned().unwrap_or_default();
                    tracing::debug!(%fqn, error = %e, "listener vetoed change");
                    return Err(match e {
                        vetoed @ CacheError::Vetoed { .. } => vetoed,
                        other => CacheError::Vetoed {
                            fqn,
                            reason: other.to_string(),
                        },
                    });
                }
                tracing::warn!(?event, error = %e, "listener failed");
            }
        }
        Ok(())
    }

    /// Fires the pre half of a paired event, applies `change`, then fires
    /// the post half. Nothing is fired when `quiet` is set.
    pub fn around<T>(
        &self,
        quiet: bool,
        event: impl Fn(bool) -> CacheEvent,
        change: impl FnOnce() -> CacheResult<T>,
    ) -> CacheResult<T> {
        if quiet || self.listener_count() == 0 {
            return change();
        }
        self.notify(event(true))?;
        let out = change()?;
        self.notify(event(false))?;
        Ok(out)
    }
}

fn same_listener(a: &Arc<dyn CacheListener>, b: &Arc<dyn CacheListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Listener that records every event, for tests and the shell.
#[derive(Default)]
pub struct RecordingListener {
    events: parking_lot::Mutex<Vec<CacheEvent>>,
}

impl RecordingListener {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events seen so far.
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().clone()
    }

    /// Drops recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl CacheListener for RecordingListener {
    fn on_event(&self, event: &CacheEvent) -> CacheResult<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
