//! Connection state machine, lifecycle events and the status snapshot

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::error;

/// `Idle → Connecting → Open → Closing → Closed`, with `ReconnectScheduled`
/// entered from `Closed` after an unrequested close and terminal `Failed`
/// once the reconnect budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    ReconnectScheduled,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Open => write!(f, "OPEN"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Closed => write!(f, "CLOSED"),
            Self::ReconnectScheduled => write!(f, "RECONNECT_SCHEDULED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Connecting {
        endpoint: String,
    },
    Open {
        endpoint: String,
    },
    Disconnected {
        /// The close came from `close()`/`connect()`, not the network
        requested: bool,
        reason: Option<String>,
    },
    Error(String),
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    Failed {
        attempts: u32,
    },
}

/// What the dashboard renders its connection indicator from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub endpoint: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            connected: false,
            reconnect_attempts: 0,
            last_error: None,
            endpoint: None,
        }
    }
}

pub type LifecycleListener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(u64, LifecycleListener)>>,
}

impl ListenerSet {
    pub(crate) fn add(self: &Arc<Self>, listener: LifecycleListener) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        ListenerHandle {
            id,
            set: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Never call with connection state locked.
    pub(crate) fn emit(&self, event: &LifecycleEvent) {
        let snapshot: Vec<LifecycleListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(?event, "lifecycle listener panicked");
            }
        }
    }
}

/// Returned by `on_lifecycle`; dropping it keeps the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    set: Weak<ListenerSet>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) -> bool {
        self.set.upgrade().is_some_and(|set| set.remove(self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_listener_panic_does_not_stop_others() {
        let set = Arc::new(ListenerSet::default());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _ = set.add(Arc::new(|_: &LifecycleEvent| panic!("bad listener")));
        let sink = seen.clone();
        let handle = set.add(Arc::new(move |ev: &LifecycleEvent| sink.lock().push(ev.clone())));

        set.emit(&LifecycleEvent::Error("refused".into()));
        assert_eq!(*seen.lock(), vec![LifecycleEvent::Error("refused".into())]);

        assert!(handle.unsubscribe());
        set.emit(&LifecycleEvent::Failed { attempts: 3 });
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::ReconnectScheduled.to_string(), "RECONNECT_SCHEDULED");
        assert_eq!(ConnectionStatus::default().state, ConnectionState::Idle);
    }
}
