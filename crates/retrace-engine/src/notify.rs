//! Per-session notification topics. A pure relay: nothing here can change
//! session state.

use retrace_common::event::SessionEvent;
use retrace_common::protocol::SessionId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

pub struct Notifier {
    topics: Mutex<HashMap<SessionId, broadcast::Sender<SessionEvent>>>,
    capacity: usize,
}

/// A consumer's membership in one session topic. Dropping it leaves the topic.
pub struct Subscription {
    session_id: SessionId,
    rx: broadcast::Receiver<SessionEvent>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event, or `None` once the topic has been closed.
    ///
    /// A consumer that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session_id = %self.session_id, skipped, "subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<SessionId, broadcast::Sender<SessionEvent>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn join(&self, session_id: &str) -> Subscription {
        let mut topics = self.topics();
        let sender = topics
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Subscription {
            session_id: session_id.to_string(),
            rx: sender.subscribe(),
        }
    }

    /// Deregister a consumer, dropping the topic once nobody listens.
    pub fn leave(&self, subscription: Subscription) {
        let session_id = subscription.session_id.clone();
        drop(subscription);
        let mut topics = self.topics();
        if topics
            .get(&session_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            topics.remove(&session_id);
        }
    }

    /// Broadcast to the event's topic. Returns how many consumers received it.
    pub fn publish(&self, event: SessionEvent) -> usize {
        let mut topics = self.topics();
        let Some(sender) = topics.get(&event.session_id) else {
            return 0;
        };
        let name = event.name();
        let session_id = event.session_id.clone();
        match sender.send(event) {
            Ok(n) => {
                debug!(%session_id, event = name, receivers = n, "published");
                n
            }
            Err(_) => {
                topics.remove(&session_id);
                0
            }
        }
    }

    /// Drop a topic; current subscribers see the end of their stream.
    pub fn close_topic(&self, session_id: &str) {
        self.topics().remove(session_id);
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.topics()
            .get(session_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}
