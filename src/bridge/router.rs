// Event router - dedupe, backlog, and bounded per-subscriber delivery

//! # Event Router
//!
//! The router owns the in-process side of the bridge. For every incoming
//! event it:
//!
//! 1. drops silently when the event id sits in the bounded dedupe window
//! 2. substitutes the module id remembered for the session when the event
//!    carries none (in-process callers may route partially-filled events;
//!    the HTTP ingress always requires a module id)
//! 3. records `session_id -> module_id` for subsequent lookups
//! 4. snapshots the subscribers for the normalized module id; with none, the
//!    event lands in a bounded per-module backlog (oldest dropped on
//!    overflow)
//! 5. otherwise delivers to every subscriber - after releasing the router
//!    lock, so a slow queue never blocks ingress
//!
//! ## Overflow policy
//!
//! Every subscription owns a bounded FIFO. A full queue pops its head and
//! decides which of {oldest, incoming} to drop:
//!
//! 1. critical events (`session_end`, `error`) are preferred for retention
//! 2. `model_response` is preferred for eviction
//! 3. otherwise the oldest is dropped
//!
//! The drop decision is implemented as a non-blocking receive-then-replace,
//! so the router never parks on a full queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::models::{normalize_module_id, Event};
use crate::{LatticeError, Result};

/// Bounds for the router's in-memory structures
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Recent event ids remembered for at-most-once delivery
    pub dedupe_window: usize,
    /// Events buffered per module before any subscriber exists
    pub backlog_limit: usize,
    /// Capacity of each subscriber queue
    pub subscriber_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dedupe_window: 1024,
            backlog_limit: 256,
            subscriber_capacity: 100,
        }
    }
}

/// FIFO-evicting set of recently seen event ids
#[derive(Debug, Default)]
struct DedupeWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Record an id; returns false when it was already present
    fn insert(&mut self, event_id: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(event_id.to_string()) {
            return false;
        }
        self.order.push_back(event_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Which side of an overflow collision gets dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropSide {
    Oldest,
    Incoming,
}

/// Decide eviction between the queue head and the incoming event
fn choose_drop(oldest: &Event, incoming: &Event) -> (DropSide, &'static str) {
    match (oldest.is_critical(), incoming.is_critical()) {
        (true, false) => (DropSide::Incoming, "non-critical yields to critical"),
        (false, true) => (DropSide::Oldest, "non-critical yields to critical"),
        _ => match (oldest.is_preferred_drop(), incoming.is_preferred_drop()) {
            (true, false) => (DropSide::Oldest, "preferred-drop type evicted"),
            (false, true) => (DropSide::Incoming, "preferred-drop type evicted"),
            _ => (DropSide::Oldest, "queue full, oldest evicted"),
        },
    }
}

struct QueueInner {
    items: VecDeque<Event>,
    closed: bool,
}

/// Bounded single-producer/single-consumer event queue
///
/// The send path is cooperative: on a full queue it performs the
/// receive-then-replace described in the module docs and never blocks.
pub(crate) struct SubscriberQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue an event, applying the overflow policy on a full queue.
    /// Deliveries to a closed queue are silently dropped.
    fn push(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }

        if inner.items.len() >= self.capacity {
            // Receive-then-replace: pop the head, keep the survivor
            let oldest = inner
                .items
                .pop_front()
                .expect("full queue has a head");
            let (side, why) = choose_drop(&oldest, &event);
            match side {
                DropSide::Incoming => {
                    debug!(
                        event_id = %event.event_id,
                        kind = %event.kind,
                        reason = why,
                        "subscriber queue full, incoming event dropped"
                    );
                    inner.items.push_front(oldest);
                }
                DropSide::Oldest => {
                    debug!(
                        event_id = %oldest.event_id,
                        kind = %oldest.kind,
                        reason = why,
                        "subscriber queue full, oldest event dropped"
                    );
                    inner.items.push_back(event);
                }
            }
        } else {
            inner.items.push_back(event);
        }
        drop(inner);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<Event> {
        self.inner.lock().unwrap().items.pop_front()
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    async fn recv(&self) -> Option<Event> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(event) = inner.items.pop_front() {
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

/// A live subscriber channel for one normalized module id
///
/// Call [`Subscription::close`] on teardown; the router drops deliveries to a
/// closed subscription and prunes it from the subscriber set eagerly.
pub struct Subscription {
    module_id: String,
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// The normalized module id this subscription receives events for
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// Wait for the next event; `None` once closed and drained
    pub async fn recv(&self) -> Option<Event> {
        self.queue.recv().await
    }

    /// Take the next pending event without waiting
    pub fn try_recv(&self) -> Option<Event> {
        self.queue.try_pop()
    }

    /// Terminate the subscription; subsequent deliveries are dropped
    pub fn close(&self) {
        self.queue.close();
    }
}

#[derive(Default)]
struct RouterState {
    subscribers: HashMap<String, Vec<Arc<SubscriberQueue>>>,
    backlog: HashMap<String, VecDeque<Event>>,
    dedupe: DedupeWindow,
    /// session id -> normalized module id, learned from routed events
    sessions: HashMap<String, String>,
}

/// Routes bridge events to in-process subscribers keyed by module identity
pub struct EventRouter {
    state: RwLock<RouterState>,
    config: RouterConfig,
}

impl EventRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            state: RwLock::new(RouterState {
                dedupe: DedupeWindow::new(config.dedupe_window),
                ..RouterState::default()
            }),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RouterConfig::default())
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, RouterState>> {
        self.state
            .write()
            .map_err(|_| LatticeError::Internal("event router state poisoned".to_string()))
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, RouterState>> {
        self.state
            .read()
            .map_err(|_| LatticeError::Internal("event router state poisoned".to_string()))
    }

    /// Route one event: dedupe, session fallback, backlog or delivery
    pub fn route(&self, event: Event) -> Result<()> {
        let targets = {
            let mut state = self.write_state()?;

            if !state.dedupe.insert(&event.event_id) {
                debug!(event_id = %event.event_id, "duplicate event dropped");
                return Ok(());
            }

            let mut module_id = normalize_module_id(&event.module_id);
            let session_id = event.session_id.trim().to_string();
            if module_id.is_empty() {
                match state.sessions.get(&session_id) {
                    Some(known) => module_id = known.clone(),
                    None => {
                        warn!(
                            event_id = %event.event_id,
                            session = %session_id,
                            "event carries no module id and the session is unknown, dropped"
                        );
                        return Ok(());
                    }
                }
            }
            if !session_id.is_empty() {
                state.sessions.insert(session_id, module_id.clone());
            }

            // Prune closed subscribers eagerly; empty sets are removed
            let mut snapshot: Vec<Arc<SubscriberQueue>> = Vec::new();
            if let Some(queues) = state.subscribers.get_mut(&module_id) {
                queues.retain(|q| !q.is_closed());
                snapshot = queues.clone();
            }

            if snapshot.is_empty() {
                state.subscribers.remove(&module_id);
                let backlog = state.backlog.entry(module_id.clone()).or_default();
                if backlog.len() >= self.config.backlog_limit {
                    if let Some(dropped) = backlog.pop_front() {
                        warn!(
                            module = %module_id,
                            event_id = %dropped.event_id,
                            kind = %dropped.kind,
                            "backlog full, oldest event dropped"
                        );
                    }
                }
                backlog.push_back(event);
                return Ok(());
            }

            snapshot
        };

        // Deliver outside the router lock; the queue send path never blocks
        for queue in targets {
            queue.push(event.clone());
        }
        Ok(())
    }

    /// Subscribe to events for a module id
    ///
    /// Any backlog buffered for the module is handed to the new subscriber in
    /// order, then cleared.
    pub fn subscribe(&self, module_id: &str) -> Result<Subscription> {
        let module_id = normalize_module_id(module_id);
        let queue = Arc::new(SubscriberQueue::new(self.config.subscriber_capacity));

        let mut state = self.write_state()?;
        if let Some(mut backlog) = state.backlog.remove(&module_id) {
            while let Some(event) = backlog.pop_front() {
                queue.push(event);
            }
        }
        state
            .subscribers
            .entry(module_id.clone())
            .or_default()
            .push(queue.clone());
        drop(state);

        debug!(module = %module_id, "subscriber attached");
        Ok(Subscription { module_id, queue })
    }

    /// Number of live subscribers for a module id
    pub fn subscriber_count(&self, module_id: &str) -> Result<usize> {
        let module_id = normalize_module_id(module_id);
        let state = self.read_state()?;
        Ok(state
            .subscribers
            .get(&module_id)
            .map(|queues| queues.iter().filter(|q| !q.is_closed()).count())
            .unwrap_or(0))
    }

    /// Number of events backlogged for a module id
    pub fn backlog_len(&self, module_id: &str) -> Result<usize> {
        let module_id = normalize_module_id(module_id);
        let state = self.read_state()?;
        Ok(state
            .backlog
            .get(&module_id)
            .map(VecDeque::len)
            .unwrap_or(0))
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PROTOCOL_VERSION;

    fn event(event_id: &str, kind: &str, module_id: &str) -> Event {
        Event {
            version: PROTOCOL_VERSION,
            event_id: event_id.to_string(),
            sequence: 0,
            kind: kind.to_string(),
            client_time: None,
            server_time: None,
            session_id: "sess-1".to_string(),
            module_id: module_id.to_string(),
            workflow: "release".to_string(),
            payload: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn routes_to_subscriber() {
        let router = EventRouter::with_defaults();
        let sub = router.subscribe("alpha").unwrap();
        router.route(event("e1", "progress", "alpha")).unwrap();

        let received = sub.recv().await.unwrap();
        assert_eq!(received.event_id, "e1");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn module_id_matching_is_normalized() {
        let router = EventRouter::with_defaults();
        let sub = router.subscribe("  Alpha ").unwrap();
        assert_eq!(sub.module_id(), "alpha");
        router.route(event("e1", "progress", "ALPHA")).unwrap();
        assert_eq!(sub.recv().await.unwrap().event_id, "e1");
    }

    #[tokio::test]
    async fn duplicate_event_ids_deliver_once() {
        let router = EventRouter::with_defaults();
        let sub = router.subscribe("alpha").unwrap();
        router.route(event("e1", "progress", "alpha")).unwrap();
        router.route(event("e1", "progress", "alpha")).unwrap();

        assert_eq!(sub.recv().await.unwrap().event_id, "e1");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn dedupe_window_evicts_fifo() {
        let router = EventRouter::new(RouterConfig {
            dedupe_window: 2,
            ..RouterConfig::default()
        });
        let sub = router.subscribe("alpha").unwrap();

        router.route(event("e1", "progress", "alpha")).unwrap();
        router.route(event("e2", "progress", "alpha")).unwrap();
        router.route(event("e3", "progress", "alpha")).unwrap();
        // e1 has been evicted from the window, so it routes again
        router.route(event("e1", "progress", "alpha")).unwrap();

        let mut ids = Vec::new();
        while let Some(received) = sub.try_recv() {
            ids.push(received.event_id);
        }
        assert_eq!(ids, vec!["e1", "e2", "e3", "e1"]);
    }

    #[tokio::test]
    async fn backlog_buffers_pre_subscription_events_in_order() {
        let router = EventRouter::with_defaults();
        router.route(event("e1", "progress", "alpha")).unwrap();
        router.route(event("e2", "progress", "alpha")).unwrap();
        assert_eq!(router.backlog_len("alpha").unwrap(), 2);

        let sub = router.subscribe("alpha").unwrap();
        assert_eq!(router.backlog_len("alpha").unwrap(), 0);
        assert_eq!(sub.recv().await.unwrap().event_id, "e1");
        assert_eq!(sub.recv().await.unwrap().event_id, "e2");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn backlog_overflow_drops_oldest() {
        let router = EventRouter::new(RouterConfig {
            backlog_limit: 2,
            ..RouterConfig::default()
        });
        router.route(event("e1", "progress", "alpha")).unwrap();
        router.route(event("e2", "progress", "alpha")).unwrap();
        router.route(event("e3", "progress", "alpha")).unwrap();

        let sub = router.subscribe("alpha").unwrap();
        assert_eq!(sub.try_recv().unwrap().event_id, "e2");
        assert_eq!(sub.try_recv().unwrap().event_id, "e3");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn session_fallback_fills_missing_module_id() {
        let router = EventRouter::with_defaults();
        let sub = router.subscribe("alpha").unwrap();

        // First event teaches the session -> module mapping
        router.route(event("e1", "progress", "alpha")).unwrap();
        // Second event arrives with no module id
        router.route(event("e2", "progress", "")).unwrap();

        assert_eq!(sub.recv().await.unwrap().event_id, "e1");
        assert_eq!(sub.recv().await.unwrap().event_id, "e2");
    }

    #[tokio::test]
    async fn unknown_session_without_module_id_is_dropped() {
        let router = EventRouter::with_defaults();
        let sub = router.subscribe("alpha").unwrap();
        router.route(event("e1", "progress", "")).unwrap();
        assert!(sub.try_recv().is_none());
        assert_eq!(router.backlog_len("alpha").unwrap(), 0);
    }

    #[tokio::test]
    async fn overflow_keeps_critical_event() {
        let router = EventRouter::new(RouterConfig {
            subscriber_capacity: 1,
            ..RouterConfig::default()
        });
        let sub = router.subscribe("alpha").unwrap();

        router.route(event("e1", "session_end", "alpha")).unwrap();
        router.route(event("e2", "model_response", "alpha")).unwrap();

        let received = sub.try_recv().unwrap();
        assert_eq!(received.event_id, "e1");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn incoming_critical_evicts_non_critical_head() {
        let router = EventRouter::new(RouterConfig {
            subscriber_capacity: 1,
            ..RouterConfig::default()
        });
        let sub = router.subscribe("alpha").unwrap();

        router.route(event("e1", "progress", "alpha")).unwrap();
        router.route(event("e2", "error", "alpha")).unwrap();

        let received = sub.try_recv().unwrap();
        assert_eq!(received.event_id, "e2");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn preferred_drop_head_yields_to_plain_incoming() {
        let router = EventRouter::new(RouterConfig {
            subscriber_capacity: 1,
            ..RouterConfig::default()
        });
        let sub = router.subscribe("alpha").unwrap();

        router.route(event("e1", "model_response", "alpha")).unwrap();
        router.route(event("e2", "progress", "alpha")).unwrap();

        assert_eq!(sub.try_recv().unwrap().event_id, "e2");
    }

    #[tokio::test]
    async fn plain_overflow_drops_oldest() {
        let router = EventRouter::new(RouterConfig {
            subscriber_capacity: 1,
            ..RouterConfig::default()
        });
        let sub = router.subscribe("alpha").unwrap();

        router.route(event("e1", "progress", "alpha")).unwrap();
        router.route(event("e2", "progress", "alpha")).unwrap();

        assert_eq!(sub.try_recv().unwrap().event_id, "e2");
    }

    #[tokio::test]
    async fn closed_subscription_is_pruned() {
        let router = EventRouter::with_defaults();
        let sub = router.subscribe("alpha").unwrap();
        assert_eq!(router.subscriber_count("alpha").unwrap(), 1);

        sub.close();
        assert!(sub.recv().await.is_none());
        assert_eq!(router.subscriber_count("alpha").unwrap(), 0);

        // Events after close land in the backlog for the next subscriber
        router.route(event("e1", "progress", "alpha")).unwrap();
        assert_eq!(router.backlog_len("alpha").unwrap(), 1);
    }

    #[tokio::test]
    async fn delivery_fans_out_to_all_subscribers() {
        let router = EventRouter::with_defaults();
        let first = router.subscribe("alpha").unwrap();
        let second = router.subscribe("alpha").unwrap();

        router.route(event("e1", "progress", "alpha")).unwrap();
        assert_eq!(first.recv().await.unwrap().event_id, "e1");
        assert_eq!(second.recv().await.unwrap().event_id, "e1");
    }

    #[tokio::test]
    async fn recv_wakes_on_later_delivery() {
        let router = Arc::new(EventRouter::with_defaults());
        let sub = router.subscribe("alpha").unwrap();

        let router_clone = router.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            router_clone.route(event("e1", "progress", "alpha")).unwrap();
        });

        let received = sub.recv().await.unwrap();
        assert_eq!(received.event_id, "e1");
        handle.await.unwrap();
    }
}
