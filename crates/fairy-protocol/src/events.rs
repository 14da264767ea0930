use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::broadcast;

/// Which peer-annotated session tags a subscriber wants to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFilter {
    /// Only untagged, browser-level events.
    Browser,
    /// Only events tagged with this session id.
    Tag(String),
    /// Everything, tagged or not.
    Any,
}

impl SessionFilter {
    pub(crate) fn matches(&self, session_id: Option<&str>) -> bool {
        match self {
            SessionFilter::Browser => session_id.is_none(),
            SessionFilter::Tag(tag) => session_id == Some(tag.as_str()),
            SessionFilter::Any => true,
        }
    }
}

/// One unsolicited event from the browser.
#[derive(Debug, Clone)]
pub struct EventPayload {
    pub method: String,
    pub session_id: Option<String>,
    pub params: Value,
}

struct Subscription {
    method: String,
    filter: SessionFilter,
    tx: broadcast::Sender<Arc<EventPayload>>,
}

/// Fan-out registry: one reader task dispatches, each subscriber owns a
/// bounded queue. A slow subscriber loses its oldest entries rather than
/// blocking the reader.
pub(crate) struct SubscriberRegistry {
    subscriptions: Mutex<Vec<Subscription>>,
    queue_depth: usize,
    dropped: Arc<AtomicU64>,
}

impl SubscriberRegistry {
    pub(crate) fn new(queue_depth: usize) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            queue_depth,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn subscribe(&self, method: &str, filter: SessionFilter) -> EventStream {
        let (tx, rx) = broadcast::channel(self.queue_depth);
        let mut guard = self.subscriptions.lock().expect("subscription lock");
        guard.push(Subscription {
            method: method.to_string(),
            filter,
            tx,
        });
        EventStream {
            rx,
            dropped: 0,
            total_dropped: Arc::clone(&self.dropped),
        }
    }

    pub(crate) fn dispatch(&self, event: Arc<EventPayload>) {
        let mut guard = self.subscriptions.lock().expect("subscription lock");
        guard.retain(|sub| {
            if sub.tx.receiver_count() == 0 {
                return false;
            }
            if sub.method == event.method && sub.filter.matches(event.session_id.as_deref()) {
                // Lagging receivers shed their oldest entries on their side;
                // send only fails when the stream is already gone.
                let _ = sub.tx.send(Arc::clone(&event));
            }
            true
        });
    }

    /// Drop all senders so every stream observes end-of-stream.
    pub(crate) fn close(&self) {
        self.subscriptions
            .lock()
            .expect("subscription lock")
            .clear();
    }

    pub(crate) fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Subscriber view: matching events in arrival order, ending when the
/// connection dies or the registry closes.
pub struct EventStream {
    rx: broadcast::Receiver<Arc<EventPayload>>,
    dropped: u64,
    total_dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// Next matching event; `None` is the end-of-stream marker.
    pub async fn next(&mut self) -> Option<Arc<EventPayload>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    self.total_dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events this subscriber lost to queue overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(method: &str, session: Option<&str>) -> Arc<EventPayload> {
        Arc::new(EventPayload {
            method: method.to_string(),
            session_id: session.map(String::from),
            params: json!({}),
        })
    }

    #[test]
    fn filter_matching() {
        assert!(SessionFilter::Browser.matches(None));
        assert!(!SessionFilter::Browser.matches(Some("S1")));
        assert!(SessionFilter::Tag("S1".into()).matches(Some("S1")));
        assert!(!SessionFilter::Tag("S1".into()).matches(Some("S2")));
        assert!(!SessionFilter::Tag("S1".into()).matches(None));
        assert!(SessionFilter::Any.matches(None));
        assert!(SessionFilter::Any.matches(Some("S1")));
    }

    #[tokio::test]
    async fn dispatch_routes_by_method_and_tag() {
        let registry = SubscriberRegistry::new(16);
        let mut tagged = registry.subscribe("Network.requestWillBeSent", SessionFilter::Tag("S1".into()));
        let mut browser = registry.subscribe("Network.requestWillBeSent", SessionFilter::Browser);
        let mut any = registry.subscribe("Network.requestWillBeSent", SessionFilter::Any);

        registry.dispatch(event("Network.requestWillBeSent", Some("S1")));
        registry.dispatch(event("Network.requestWillBeSent", Some("S2")));
        registry.dispatch(event("Network.requestWillBeSent", None));
        registry.dispatch(event("Runtime.consoleAPICalled", Some("S1")));
        registry.close();

        let mut tagged_seen = 0;
        while tagged.next().await.is_some() {
            tagged_seen += 1;
        }
        let mut browser_seen = 0;
        while browser.next().await.is_some() {
            browser_seen += 1;
        }
        let mut any_seen = 0;
        while any.next().await.is_some() {
            any_seen += 1;
        }

        assert_eq!(tagged_seen, 1);
        assert_eq!(browser_seen, 1);
        assert_eq!(any_seen, 3);
    }

    #[tokio::test]
    async fn slow_subscriber_sheds_oldest_and_counts() {
        let registry = SubscriberRegistry::new(4);
        let mut stream = registry.subscribe("Log.entryAdded", SessionFilter::Any);

        for _ in 0..10 {
            registry.dispatch(event("Log.entryAdded", None));
        }
        registry.close();

        let mut seen = 0;
        while stream.next().await.is_some() {
            seen += 1;
        }
        assert_eq!(seen, 4);
        assert_eq!(stream.dropped(), 6);
        assert_eq!(registry.dropped_total(), 6);
    }

    #[tokio::test]
    async fn close_ends_streams() {
        let registry = SubscriberRegistry::new(4);
        let mut stream = registry.subscribe("Page.loadEventFired", SessionFilter::Any);
        registry.close();
        assert!(stream.next().await.is_none());
    }
}
