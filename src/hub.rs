//! Fan-out of server events to attached connections.
//!
//! Every transport connection owns a bounded queue that its writer task drains into the socket.
//! Pushing into a queue never waits: typing indicators are dropped when a queue is full, anything
//! else evicts the connection so that chat and presence are never silently lost. Evicted
//! connections are parked until the session layer takes them and tears them down.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Notify,
};
use tracing::{debug, warn};

use crate::{
    protocol::{Delivery, ServerEvent},
    registry::ConnectionId,
};

/// One serialized frame, shared by every destination of a broadcast.
pub type Frame = Arc<str>;

struct Outbox {
    tx: mpsc::Sender<Frame>,
    /// Fired once the hub lets go of the connection, so the transport can hang up.
    closed: Arc<Notify>,
}

#[derive(Default)]
struct Outboxes {
    attached: HashMap<ConnectionId, Outbox>,
    evicted: Vec<ConnectionId>,
}

pub struct Hub {
    outboxes: Mutex<Outboxes>,
    queue_capacity: usize,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            outboxes: Mutex::new(Outboxes::default()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Starts delivering to `connection_id`. The receiver closes once the connection is detached
    /// or evicted and its remaining frames are drained.
    pub fn attach(&self, connection_id: ConnectionId) -> mpsc::Receiver<Frame> {
        self.attach_socket(connection_id).0
    }

    /// Like [`Hub::attach`], plus a signal that fires when the hub detaches or evicts the
    /// connection.
    pub fn attach_socket(&self, connection_id: ConnectionId) -> (mpsc::Receiver<Frame>, Arc<Notify>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let closed = Arc::new(Notify::new());
        self.lock().attached.insert(connection_id, Outbox { tx, closed: Arc::clone(&closed) });
        (rx, closed)
    }

    /// Returns whether the connection was still attached.
    pub fn detach(&self, connection_id: ConnectionId) -> bool {
        match self.lock().attached.remove(&connection_id) {
            Some(outbox) => {
                outbox.closed.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self, connection_id: ConnectionId) -> bool {
        self.lock().attached.contains_key(&connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().attached.len()
    }

    /// Connections evicted since the last call, each reported once.
    pub fn take_evicted(&self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.lock().evicted)
    }

    /// Delivers to every attached connection, the originator included.
    pub fn broadcast_all(&self, event: &ServerEvent) {
        self.fan_out(event, |_| true);
    }

    pub fn broadcast_except(&self, event: &ServerEvent, excluded: ConnectionId) {
        self.fan_out(event, |id| id != excluded);
    }

    /// A target that is not attached is a silent no-op.
    pub fn unicast(&self, target: ConnectionId, event: &ServerEvent) {
        self.fan_out(event, |id| id == target);
    }

    fn fan_out(&self, event: &ServerEvent, filter: impl Fn(ConnectionId) -> bool) {
        let recipients: Vec<(ConnectionId, mpsc::Sender<Frame>)> = self
            .lock()
            .attached
            .iter()
            .filter(|(id, _)| filter(**id))
            .map(|(id, outbox)| (*id, outbox.tx.clone()))
            .collect();
        if recipients.is_empty() {
            return;
        }

        let frame: Frame = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                warn!(event = event.name(), error = %e, "failed to serialize event");
                return;
            }
        };

        let delivery = event.delivery();
        let mut evicted = Vec::new();
        for (id, tx) in &recipients {
            match tx.try_send(Arc::clone(&frame)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) if delivery == Delivery::Transient => {
                    debug!(conn_id = %id, event = event.name(), "queue full, dropping transient event");
                }
                Err(TrySendError::Full(_)) => {
                    warn!(conn_id = %id, event = event.name(), "queue full, disconnecting slow client");
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => evicted.push(*id),
            }
        }
        debug!(event = event.name(), recipients = recipients.len(), "fanned out event");

        if !evicted.is_empty() {
            let mut outboxes = self.lock();
            for id in evicted {
                if let Some(outbox) = outboxes.attached.remove(&id) {
                    outbox.closed.notify_one();
                    outboxes.evicted.push(id);
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Outboxes> {
        self.outboxes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use uuid::Uuid;

    use super::*;
    use crate::protocol::{Left, Typing};

    fn left(username: &str) -> ServerEvent {
        ServerEvent::Left(Left { username: username.into() })
    }

    fn typing(username: &str) -> ServerEvent {
        ServerEvent::PeerTyping(Typing { username: username.into() })
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    #[test]
    fn broadcast_all_reaches_originator_too() {
        let hub = Hub::new(8);
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        let mut rx_a = hub.attach(a);
        let mut rx_b = hub.attach(b);

        hub.broadcast_all(&left("ada"));

        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn broadcast_except_skips_one() {
        let hub = Hub::new(8);
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        let mut rx_a = hub.attach(a);
        let mut rx_b = hub.attach(b);

        hub.broadcast_except(&typing("ada"), a);

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b)[0]["event"], "peer-typing");
    }

    #[test]
    fn unicast_to_absent_target_is_a_no_op() {
        let hub = Hub::new(8);
        let a = Uuid::now_v7();
        let mut rx_a = hub.attach(a);

        hub.unicast(Uuid::now_v7(), &left("ghost"));

        assert!(drain(&mut rx_a).is_empty());
        assert!(hub.is_attached(a));
    }

    #[test]
    fn per_destination_order_is_fifo() {
        let hub = Hub::new(16);
        let a = Uuid::now_v7();
        let mut rx_a = hub.attach(a);

        for name in ["one", "two", "three"] {
            hub.broadcast_all(&left(name));
        }
        hub.unicast(a, &left("four"));

        let names: Vec<_> = drain(&mut rx_a)
            .into_iter()
            .map(|frame| frame["data"]["username"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["one", "two", "three", "four"]);
    }

    #[test]
    fn full_queue_drops_transient_but_keeps_connection() {
        let hub = Hub::new(2);
        let a = Uuid::now_v7();
        let mut rx_a = hub.attach(a);

        for _ in 0..5 {
            hub.broadcast_all(&typing("bob"));
        }

        assert!(hub.is_attached(a));
        assert_eq!(drain(&mut rx_a).len(), 2);
    }

    #[tokio::test]
    async fn full_queue_evicts_on_reliable_event() {
        let hub = Hub::new(2);
        let (slow, fast) = (Uuid::now_v7(), Uuid::now_v7());
        let mut rx_slow = hub.attach(slow);
        let mut rx_fast = hub.attach(fast);

        for name in ["one", "two", "three"] {
            hub.broadcast_all(&left(name));
            drain(&mut rx_fast);
        }

        assert!(!hub.is_attached(slow));
        assert!(hub.is_attached(fast));
        assert_eq!(hub.take_evicted(), vec![slow]);
        assert!(hub.take_evicted().is_empty());
        // what was queued before eviction still drains, then the queue reports closed
        assert!(rx_slow.recv().await.is_some());
        assert!(rx_slow.recv().await.is_some());
        assert!(rx_slow.recv().await.is_none());
    }

    #[test]
    fn detach_stops_delivery_and_is_idempotent() {
        let hub = Hub::new(8);
        let a = Uuid::now_v7();
        let mut rx_a = hub.attach(a);

        assert!(hub.detach(a));
        assert!(!hub.detach(a));
        hub.broadcast_all(&left("ada"));

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn eviction_fires_close_signal() {
        let hub = Hub::new(1);
        let slow = Uuid::now_v7();
        let (_rx, closed) = hub.attach_socket(slow);

        hub.broadcast_all(&left("one"));
        hub.broadcast_all(&left("two"));

        // notify_one keeps a permit, so this completes even though the signal fired first
        closed.notified().await;
        assert_eq!(hub.take_evicted(), vec![slow]);
    }

    #[tokio::test]
    async fn detach_fires_close_signal_but_is_not_an_eviction() {
        let hub = Hub::new(4);
        let conn = Uuid::now_v7();
        let (_rx, closed) = hub.attach_socket(conn);

        hub.detach(conn);

        closed.notified().await;
        assert!(hub.take_evicted().is_empty());
    }
}
