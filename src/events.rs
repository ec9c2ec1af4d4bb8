//! Event subscriptions and dispatch.
//!
//! The [`EventDispatcher`] holds an explicit table of registrations owned by
//! one client. A registration binds either a single `eventType` or every event
//! (wildcard) to a handler. For each inbound event, matching named handlers run
//! first in registration order, then wildcard handlers in registration order.
//!
//! Handlers run on the reader task, so they must not block. A handler that
//! returns an error or panics is logged and skipped; delivery continues with
//! the next handler.
//!
//! Besides callbacks, every event is also published on a
//! [`tokio::sync::broadcast`] channel for consumers that prefer a stream.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::protocol::Event;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// An event pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ObsEvent {
    pub event_type: String,
    pub event_intent: u32,
    /// `eventData`, or `Value::Null` when the server sent none.
    pub event_data: Value,
}

impl From<Event> for ObsEvent {
    fn from(e: Event) -> Self {
        Self {
            event_type: e.event_type,
            event_intent: e.event_intent,
            event_data: e.event_data.unwrap_or(Value::Null),
        }
    }
}

/// Error type handlers may return; only its message is used.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(&ObsEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Token returned by subscribe calls, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
enum Filter {
    Named(String),
    All,
}

struct Registration {
    id: SubscriptionId,
    filter: Filter,
    handler: Handler,
}

pub struct EventDispatcher {
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
    failures: AtomicU64,
    stream: broadcast::Sender<ObsEvent>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registrations: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            failures: AtomicU64::new(0),
            stream,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, filter: Filter, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Registration {
            id,
            filter,
            handler,
        });
        id
    }

    /// Register a handler for one `eventType`.
    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&ObsEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.add(Filter::Named(event_type.to_string()), Arc::new(handler))
    }

    /// Register a handler for every event.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ObsEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.add(Filter::All, Arc::new(handler))
    }

    /// Remove a registration. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut regs = self.lock();
        let before = regs.len();
        regs.retain(|r| r.id != id);
        regs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of handler invocations that returned an error or panicked.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// A receiver for the catch-all event stream. Only events dispatched after
    /// this call are seen.
    pub fn stream(&self) -> broadcast::Receiver<ObsEvent> {
        self.stream.subscribe()
    }

    /// Deliver one event to every matching handler, then to the stream.
    pub fn dispatch(&self, event: &ObsEvent) {
        // Snapshot so handlers may (un)subscribe without deadlocking.
        let (named, wildcard): (Vec<_>, Vec<_>) = {
            let regs = self.lock();
            let named = regs
                .iter()
                .filter(|r| matches!(&r.filter, Filter::Named(n) if *n == event.event_type))
                .map(|r| (r.id, Arc::clone(&r.handler)))
                .collect();
            let wildcard = regs
                .iter()
                .filter(|r| matches!(r.filter, Filter::All))
                .map(|r| (r.id, Arc::clone(&r.handler)))
                .collect();
            (named, wildcard)
        };

        for (id, handler) in named.into_iter().chain(wildcard) {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(event_type = %event.event_type, subscription = id.0, "Event handler failed: {e}");
                }
                Err(_) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(event_type = %event.event_type, subscription = id.0, "Event handler panicked");
                }
            }
        }

        // No receivers is fine.
        let _ = self.stream.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str) -> ObsEvent {
        ObsEvent {
            event_type: event_type.to_string(),
            event_intent: 4,
            event_data: json!({"sceneName": "Live"}),
        }
    }

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn named_then_wildcard_in_registration_order() {
        let d = EventDispatcher::new();
        let log = recorder();

        let l = Arc::clone(&log);
        d.subscribe_all(move |e| {
            l.lock().unwrap().push(format!("all1:{}", e.event_type));
            Ok(())
        });
        let l = Arc::clone(&log);
        d.subscribe("CurrentProgramSceneChanged", move |_| {
            l.lock().unwrap().push("named1".into());
            Ok(())
        });
        let l = Arc::clone(&log);
        d.subscribe("CurrentProgramSceneChanged", move |_| {
            l.lock().unwrap().push("named2".into());
            Ok(())
        });
        let l = Arc::clone(&log);
        d.subscribe("StreamStateChanged", move |_| {
            l.lock().unwrap().push("other".into());
            Ok(())
        });

        d.dispatch(&event("CurrentProgramSceneChanged"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["named1", "named2", "all1:CurrentProgramSceneChanged"]
        );
    }

    #[test]
    fn failing_handlers_do_not_stop_delivery() {
        let d = EventDispatcher::new();
        let log = recorder();

        d.subscribe("InputMuteStateChanged", |_| Err("boom".into()));
        d.subscribe("InputMuteStateChanged", |_| panic!("handler bug"));
        let l = Arc::clone(&log);
        d.subscribe("InputMuteStateChanged", move |e| {
            l.lock().unwrap().push(e.event_data["sceneName"].to_string());
            Ok(())
        });

        d.dispatch(&event("InputMuteStateChanged"));
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(d.failure_count(), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let d = EventDispatcher::new();
        let log = recorder();
        let l = Arc::clone(&log);
        let id = d.subscribe("SceneCreated", move |_| {
            l.lock().unwrap().push("hit".into());
            Ok(())
        });

        d.dispatch(&event("SceneCreated"));
        assert!(d.unsubscribe(id));
        assert!(!d.unsubscribe(id));
        d.dispatch(&event("SceneCreated"));
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(d.subscriber_count(), 0);
    }

    #[test]
    fn handler_may_unsubscribe_itself() {
        let d = Arc::new(EventDispatcher::new());
        let weak = Arc::downgrade(&d);
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let s = Arc::clone(&slot);
        let id = d.subscribe("ExitStarted", move |_| {
            if let (Some(d), Some(id)) = (weak.upgrade(), *s.lock().unwrap()) {
                d.unsubscribe(id);
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(id);

        d.dispatch(&event("ExitStarted"));
        assert_eq!(d.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn stream_receives_every_event() {
        let d = EventDispatcher::new();
        let mut rx = d.stream();
        d.dispatch(&event("RecordStateChanged"));
        d.dispatch(&event("StreamStateChanged"));
        assert_eq!(rx.recv().await.unwrap().event_type, "RecordStateChanged");
        assert_eq!(rx.recv().await.unwrap().event_type, "StreamStateChanged");
    }

    #[test]
    fn converts_missing_event_data_to_null() {
        let e: ObsEvent = Event {
            event_type: "ExitStarted".into(),
            event_intent: 1,
            event_data: None,
        }
        .into();
        assert_eq!(e.event_data, Value::Null);
    }
}
