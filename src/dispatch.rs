//! Fan-out of events to the sockets registered on a topic.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    events::{Event, RoutedEvent},
    registry::{Connection, ConnectionRegistry, Topic},
};

/// A connection that was torn down, with the topics it was still on.
#[derive(Debug)]
pub struct DroppedConnection {
    pub connection: Arc<Connection>,
    pub topics: Vec<Topic>,
}

/// Writes events to sockets and evicts the ones that can't take them.
///
/// Safe to share: publishing only takes a registry snapshot and does non-blocking queue
/// pushes, so observers, socket tasks and the lifecycle controller may all call it at once.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    dropped: mpsc::UnboundedSender<DroppedConnection>,
}

impl Dispatcher {
    /// The receiver yields every torn-down connection exactly once.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<DroppedConnection>) {
        let (dropped, rx) = mpsc::unbounded_channel();
        (Self { registry, dropped }, rx)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Sends `event` to everyone on `topic`. Returns how many sockets accepted it.
    pub fn publish(&self, topic: &Topic, event: &Event) -> usize {
        let subscribers = self.registry.snapshot(topic);
        if subscribers.is_empty() {
            return 0;
        }

        let frame = match serde_json::to_string(event) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                warn!(event_type = ?event.event_type, error = %e, "failed to serialize event");
                return 0;
            }
        };

        let mut delivered = 0;
        for conn in &subscribers {
            if conn.send(frame.clone()) {
                delivered += 1;
            } else {
                warn!(conn_id = %conn.id(), %topic, "send failed, dropping connection");
                self.disconnect(conn);
            }
        }

        debug!(
            event_type = ?event.event_type,
            %topic,
            recipients = subscribers.len(),
            delivered,
            "published event"
        );
        delivered
    }

    pub fn publish_all(&self, events: &[RoutedEvent]) {
        for routed in events {
            let _ = self.publish(&routed.topic, &routed.event);
        }
    }

    /// Closes `conn` and forgets it. Repeated calls for the same connection are no-ops.
    pub fn disconnect(&self, conn: &Arc<Connection>) {
        let topics = self.registry.drop_connection(conn);
        if topics.is_empty() {
            return;
        }

        let dropped = DroppedConnection {
            connection: conn.clone(),
            topics,
        };
        if self.dropped.send(dropped).is_err() {
            debug!(conn_id = %conn.id(), "lifecycle controller gone, skipping teardown checks");
        }
    }
}
