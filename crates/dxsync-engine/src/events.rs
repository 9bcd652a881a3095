//! Per-helper publish/subscribe for progress and per-item outcomes.

use std::collections::HashMap;
use std::sync::Mutex;

use dxsync_core::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEvent {
    Pulled,
    Pushed,
    PulledError,
    PushedError,
    Deleted,
    DeletedError,
    Rewrote,
}

impl SyncEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncEvent::Pulled => "pulled",
            SyncEvent::Pushed => "pushed",
            SyncEvent::PulledError => "pulled-error",
            SyncEvent::PushedError => "pushed-error",
            SyncEvent::Deleted => "deleted",
            SyncEvent::DeletedError => "deleted-error",
            SyncEvent::Rewrote => "rewrote",
        }
    }
}

pub struct EventPayload<'a> {
    pub path: &'a str,
    pub error: Option<&'a SyncError>,
}

type Listener = Box<dyn Fn(&EventPayload<'_>) + Send + Sync>;

/// Listeners run synchronously in registration order; nothing is buffered,
/// so a late subscriber misses earlier events. Listeners must not
/// subscribe from within a callback.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<SyncEvent, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        event: SyncEvent,
        listener: impl Fn(&EventPayload<'_>) + Send + Sync + 'static,
    ) {
        self.listeners
            .lock()
            .expect("event bus poisoned")
            .entry(event)
            .or_default()
            .push(Box::new(listener));
    }

    pub fn emit(&self, event: SyncEvent, path: &str, error: Option<&SyncError>) {
        let listeners = self.listeners.lock().expect("event bus poisoned");
        if let Some(registered) = listeners.get(&event) {
            let payload = EventPayload { path, error };
            for listener in registered {
                listener(&payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn listeners_fire_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.subscribe(SyncEvent::Pushed, move |payload| {
                seen.lock().unwrap().push(format!("{tag}:{}", payload.path));
            });
        }
        bus.emit(SyncEvent::Pushed, "/a", None);
        assert_eq!(
            *seen.lock().unwrap(),
            ["first:/a", "second:/a", "third:/a"]
        );
    }

    #[test]
    fn events_are_independent_channels() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0usize));
        {
            let hits = hits.clone();
            bus.subscribe(SyncEvent::PulledError, move |payload| {
                assert!(payload.error.is_some());
                *hits.lock().unwrap() += 1;
            });
        }
        bus.emit(SyncEvent::Pulled, "/a", None);
        assert_eq!(*hits.lock().unwrap(), 0);
        let err = SyncError::Cancelled;
        bus.emit(SyncEvent::PulledError, "/a", Some(&err));
        assert_eq!(*hits.lock().unwrap(), 1);
    }
}
