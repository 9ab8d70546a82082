use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::frame::Will;
use super::topic::Topic;

/// A message handed to a subscribed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: String,
}

pub type SessionId = u64;

struct Session {
    client_id: String,
    patterns: Vec<Topic>,
    tx: mpsc::UnboundedSender<Delivery>,
    will: Option<Will>,
}

impl Session {
    fn wants(&self, topic: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(topic).is_some())
    }
}

#[derive(Default)]
struct BrokerState {
    retained: BTreeMap<String, String>,
    sessions: HashMap<SessionId, Session>,
    next_id: SessionId,
}

/// In-memory pub/sub broker with retained messages and last wills.
///
/// Used directly by the local transport and wrapped by the socket server.
#[derive(Default)]
pub struct Broker {
    state: Mutex<BrokerState>,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // Nothing panics while holding the lock, recover rather than propagate poison.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a session. A previous session with the same client id is dropped without its will.
    pub fn attach(
        &self,
        client_id: &str,
        will: Option<Will>,
    ) -> (SessionId, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        let stale: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.client_id == client_id)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            info!("Client '{}' reconnected, dropping old session", client_id);
            state.sessions.remove(&id);
        }

        state.next_id += 1;
        let id = state.next_id;
        state.sessions.insert(
            id,
            Session {
                client_id: client_id.to_string(),
                patterns: Vec::new(),
                tx,
                will,
            },
        );
        debug!("Client '{}' attached as session {}", client_id, id);
        (id, rx)
    }

    /// Add a subscription and replay matching retained messages to the session.
    pub fn subscribe(&self, id: SessionId, pattern: Topic) {
        let mut state = self.lock();
        let replay: Vec<Delivery> = state
            .retained
            .iter()
            .filter(|(topic, _)| pattern.matches(topic).is_some())
            .map(|(topic, payload)| Delivery {
                topic: topic.clone(),
                payload: payload.clone(),
            })
            .collect();

        if let Some(session) = state.sessions.get_mut(&id) {
            trace!(client = %session.client_id, pattern = %pattern, "Subscribe");
            for delivery in replay {
                let _ = session.tx.send(delivery);
            }
            if !session.patterns.contains(&pattern) {
                session.patterns.push(pattern);
            }
        }
    }

    /// Publish to every interested session, once per session.
    ///
    /// A retained publish with an empty payload clears the retained message.
    pub fn publish(&self, topic: &str, payload: &str, retain: bool) {
        let mut state = self.lock();
        if retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), payload.to_string());
            }
        }

        trace!(topic = %topic, retain = retain, "Publish");
        for session in state.sessions.values().filter(|s| s.wants(topic)) {
            let _ = session.tx.send(Delivery {
                topic: topic.to_string(),
                payload: payload.to_string(),
            });
        }
    }

    /// Close a session. An unclean close publishes the session's will.
    pub fn detach(&self, id: SessionId, clean: bool) {
        let removed = self.lock().sessions.remove(&id);
        let Some(session) = removed else {
            return;
        };

        if clean {
            debug!("Client '{}' disconnected", session.client_id);
            return;
        }

        info!("Client '{}' disconnected uncleanly", session.client_id);
        if let Some(will) = session.will {
            self.publish(&will.topic, &will.payload, will.retain);
        }
    }

    pub fn is_attached(&self, id: SessionId) -> bool {
        self.lock().sessions.contains_key(&id)
    }

    pub fn retained(&self, topic: &str) -> Option<String> {
        self.lock().retained.get(topic).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(s: &str) -> Topic {
        Topic::parse(s).unwrap()
    }

    #[test]
    fn test_retained_replayed_on_subscribe() {
        let broker = Broker::new();
        broker.publish("astoria/astdiskd", r#"{"status":"RUNNING"}"#, true);

        let (id, mut rx) = broker.attach("astmetad", None);
        broker.subscribe(id, topic("astoria/+"));

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.topic, "astoria/astdiskd");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_empty_retained_clears() {
        let broker = Broker::new();
        broker.publish("astoria/astdiskd", "{}", true);
        broker.publish("astoria/astdiskd", "", true);
        assert_eq!(broker.retained("astoria/astdiskd"), None);
    }

    #[test]
    fn test_delivered_once_with_overlapping_patterns() {
        let broker = Broker::new();
        let (id, mut rx) = broker.attach("client", None);
        broker.subscribe(id, topic("astoria/+"));
        broker.subscribe(id, topic("astoria/astdiskd"));

        broker.publish("astoria/astdiskd", "{}", false);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_will_published_on_unclean_detach() {
        let broker = Broker::new();
        let will = Will {
            topic: "astoria/astprocd".to_string(),
            payload: r#"{"status":"STOPPED"}"#.to_string(),
            retain: true,
        };
        let (procd, _procd_rx) = broker.attach("astprocd", Some(will));
        let (watcher, mut rx) = broker.attach("watcher", None);
        broker.subscribe(watcher, topic("astoria/+"));

        broker.detach(procd, false);

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.payload, r#"{"status":"STOPPED"}"#);
        assert_eq!(
            broker.retained("astoria/astprocd").as_deref(),
            Some(r#"{"status":"STOPPED"}"#)
        );
    }

    #[test]
    fn test_clean_detach_suppresses_will() {
        let broker = Broker::new();
        let will = Will {
            topic: "astoria/astprocd".to_string(),
            payload: "gone".to_string(),
            retain: true,
        };
        let (id, _rx) = broker.attach("astprocd", Some(will));
        broker.detach(id, true);
        assert_eq!(broker.retained("astoria/astprocd"), None);
        assert!(!broker.is_attached(id));
    }

    #[test]
    fn test_reattach_replaces_session() {
        let broker = Broker::new();
        let (first, _rx1) = broker.attach("astmetad", None);
        let (second, _rx2) = broker.attach("astmetad", None);
        assert!(!broker.is_attached(first));
        assert!(broker.is_attached(second));
    }
}
