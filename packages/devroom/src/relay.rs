//! Room relay
//!
//! Fans events out to every connection joined to a workspace room. Each
//! subscriber owns a bounded FIFO queue; delivery is at-most-once. A full
//! queue drops the event for that subscriber only, a closed queue is pruned.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::metrics::ServerMetrics;
use crate::protocol::RelayEvent;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one attached connection, unique for the lifetime of the process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Receiving end of one room membership
pub struct RelaySubscription {
    workspace_id: String,
    connection: ConnectionId,
    receiver: mpsc::Receiver<RelayEvent>,
}

impl RelaySubscription {
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Next event for this subscriber. `None` once the relay dropped the membership.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        self.receiver.try_recv().ok()
    }
}

type Room = HashMap<ConnectionId, mpsc::Sender<RelayEvent>>;

pub struct RoomRelay {
    rooms: RwLock<HashMap<String, Room>>,
    queue_capacity: usize,
    metrics: Arc<ServerMetrics>,
}

impl RoomRelay {
    pub fn new(queue_capacity: usize, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            metrics,
        }
    }

    pub async fn join(&self, workspace_id: &str, connection: ConnectionId) -> RelaySubscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(workspace_id.to_string()).or_default();
        room.insert(connection, tx);
        info!(
            "{} joined room {} ({} subscribers)",
            connection,
            workspace_id,
            room.len()
        );

        RelaySubscription {
            workspace_id: workspace_id.to_string(),
            connection,
            receiver: rx,
        }
    }

    /// Deliver to every subscriber except `from`
    pub async fn publish(&self, workspace_id: &str, from: ConnectionId, event: RelayEvent) {
        self.deliver(workspace_id, Some(from), event).await;
    }

    /// Deliver to every subscriber, for events with no originating connection
    pub async fn broadcast(&self, workspace_id: &str, event: RelayEvent) {
        self.deliver(workspace_id, None, event).await;
    }

    pub async fn leave(&self, workspace_id: &str, connection: ConnectionId) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(workspace_id) {
            room.remove(&connection);
            info!(
                "{} left room {} ({} subscribers)",
                connection,
                workspace_id,
                room.len()
            );
            if room.is_empty() {
                rooms.remove(workspace_id);
            }
        }
    }

    pub async fn subscriber_count(&self, workspace_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(workspace_id)
            .map(|room| room.len())
            .unwrap_or(0)
    }

    async fn deliver(&self, workspace_id: &str, skip: Option<ConnectionId>, event: RelayEvent) {
        let mut closed = Vec::new();
        {
            let rooms = self.rooms.read().await;
            let Some(room) = rooms.get(workspace_id) else {
                debug!("No subscribers in room {}", workspace_id);
                return;
            };

            for (connection, tx) in room {
                if Some(*connection) == skip {
                    continue;
                }
                match tx.try_send(event.clone()) {
                    Ok(()) => self.metrics.message_relayed(),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            "Relay queue full for {} in room {}, dropping event",
                            connection, workspace_id
                        );
                        self.metrics.message_dropped();
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*connection),
                }
            }
        }

        if !closed.is_empty() {
            let mut rooms = self.rooms.write().await;
            if let Some(room) = rooms.get_mut(workspace_id) {
                for connection in &closed {
                    debug!("Pruning closed subscriber {} from room {}", connection, workspace_id);
                    room.remove(connection);
                }
                if room.is_empty() {
                    rooms.remove(workspace_id);
                }
            }
        }
    }
}
