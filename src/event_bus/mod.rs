//! In-process fan-out of domain events with a bounded replay ring.
//!
//! Every event gets a process-lifetime sequence number starting at 1. Each
//! subscriber owns a bounded outbox; a subscriber that cannot keep up loses
//! events (marked by a gap control message) without ever blocking the
//! emitter or other subscribers.

mod event;

pub use event::{Event, EventKind};

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// What a subscriber receives: live or replayed events, or a marker that
/// events starting at `from` were dropped for this subscriber only.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(Event),
    Gap { from: u64 },
}

struct SubscriberSlot {
    tx: mpsc::Sender<StreamItem>,
    /// First dropped sequence, if this subscriber overflowed.
    pending_gap: Option<u64>,
}

struct BusInner {
    next_sequence: u64,
    ring: VecDeque<Event>,
    capacity: usize,
    subscribers: Vec<SubscriberSlot>,
}

pub struct EventBus {
    inner: Mutex<BusInner>,
}

/// Replay backlog plus the live stream, duplicate-free: live events start
/// strictly after the backlog's last sequence.
pub struct EventSubscription {
    pub backlog: Vec<Event>,
    pub rx: mpsc::Receiver<StreamItem>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_sequence: 1,
                ring: VecDeque::with_capacity(capacity),
                capacity,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Emit an event: assign the next sequence, store it in the ring and
    /// fan out to all live subscribers. Never blocks.
    pub fn emit(&self, container_id: Option<&str>, kind: EventKind) -> u64 {
        let mut inner = self.inner.lock().unwrap();

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let event = Event {
            sequence,
            at: Utc::now(),
            container_id: container_id.map(str::to_string),
            kind,
        };

        log::debug!("event seq={} kind={}", sequence, event.kind.name());

        if inner.ring.len() >= inner.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event.clone());

        inner
            .subscribers
            .retain_mut(|slot| deliver(slot, &event));

        sequence
    }

    /// Register a subscriber. With `from_sequence`, buffered events with
    /// sequence ≥ `from_sequence` (that are still in the ring) are returned
    /// as the backlog; live delivery starts after them.
    pub fn subscribe(&self, from_sequence: Option<u64>) -> EventSubscription {
        let mut inner = self.inner.lock().unwrap();

        let backlog = match from_sequence {
            Some(from) => inner
                .ring
                .iter()
                .filter(|e| e.sequence >= from)
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        let (tx, rx) = mpsc::channel(inner.capacity.max(1));
        inner.subscribers.push(SubscriberSlot {
            tx,
            pending_gap: None,
        });

        EventSubscription { backlog, rx }
    }

    /// Buffered events with sequence ≥ `from`, newest last.
    pub fn replay(&self, from: u64) -> Vec<Event> {
        let inner = self.inner.lock().unwrap();
        inner
            .ring
            .iter()
            .filter(|e| e.sequence >= from)
            .cloned()
            .collect()
    }

    /// Sequence assigned to the most recent event (0 if none yet).
    pub fn last_sequence(&self) -> u64 {
        self.inner.lock().unwrap().next_sequence - 1
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

/// Returns false when the subscriber is gone. A full outbox drops the event
/// for this subscriber and remembers the first dropped sequence; the gap
/// marker is delivered as soon as the outbox has room again.
fn deliver(slot: &mut SubscriberSlot, event: &Event) -> bool {
    if let Some(from) = slot.pending_gap {
        match slot.tx.try_send(StreamItem::Gap { from }) {
            Ok(()) => slot.pending_gap = None,
            Err(mpsc::error::TrySendError::Full(_)) => return true,
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
        }
    }

    match slot.tx.try_send(StreamItem::Event(event.clone())) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            slot.pending_gap = Some(event.sequence);
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_kind(n: usize) -> EventKind {
        EventKind::ContainerRegistered {
            name: format!("c-{n}"),
            image_ref: "app:1".into(),
        }
    }

    #[test]
    fn sequences_are_monotonic_from_one() {
        let bus = EventBus::new(16);
        assert_eq!(bus.emit(None, ping_kind(0)), 1);
        assert_eq!(bus.emit(None, ping_kind(1)), 2);
        assert_eq!(bus.emit(None, ping_kind(2)), 3);
        assert_eq!(bus.last_sequence(), 3);
    }

    #[test]
    fn ring_evicts_oldest() {
        let bus = EventBus::new(3);
        for n in 0..5 {
            bus.emit(None, ping_kind(n));
        }

        let replayed = bus.replay(0);
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].sequence, 3);
        assert_eq!(replayed[2].sequence, 5);
    }

    #[tokio::test]
    async fn live_delivery_in_order() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(None);

        bus.emit(Some("c1"), ping_kind(0));
        bus.emit(Some("c2"), ping_kind(1));

        match sub.rx.recv().await.unwrap() {
            StreamItem::Event(e) => assert_eq!(e.sequence, 1),
            other => panic!("expected event, got {other:?}"),
        }
        match sub.rx.recv().await.unwrap() {
            StreamItem::Event(e) => assert_eq!(e.sequence, 2),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn replay_then_live_is_duplicate_free() {
        let bus = EventBus::new(16);
        bus.emit(None, ping_kind(0));
        bus.emit(None, ping_kind(1));

        let mut sub = bus.subscribe(Some(0));
        assert_eq!(sub.backlog.len(), 2);
        assert_eq!(sub.backlog[0].sequence, 1);

        bus.emit(None, ping_kind(2));
        match sub.rx.recv().await.unwrap() {
            StreamItem::Event(e) => assert_eq!(e.sequence, 3),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn replay_honours_from_sequence() {
        let bus = EventBus::new(16);
        for n in 0..5 {
            bus.emit(None, ping_kind(n));
        }

        let sub = bus.subscribe(Some(4));
        let seqs: Vec<u64> = sub.backlog.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn slow_subscriber_gets_gap_others_get_everything() {
        let bus = EventBus::new(8);
        let mut slow = bus.subscribe(None);
        let mut fast = bus.subscribe(None);

        // Slow subscriber never reads while 20 events are emitted
        for n in 0..20 {
            bus.emit(None, ping_kind(n));
            // Fast subscriber keeps draining
            match fast.rx.recv().await.unwrap() {
                StreamItem::Event(e) => assert_eq!(e.sequence, n as u64 + 1),
                other => panic!("fast subscriber saw {other:?}"),
            }
        }

        // Slow subscriber: the first 8 events, then nothing until it drains
        for want in 1..=8u64 {
            match slow.rx.try_recv().unwrap() {
                StreamItem::Event(e) => assert_eq!(e.sequence, want),
                other => panic!("expected event, got {other:?}"),
            }
        }
        assert!(slow.rx.try_recv().is_err());

        // The next emission delivers the gap marker, then the new tail
        bus.emit(None, ping_kind(20));
        match slow.rx.recv().await.unwrap() {
            StreamItem::Gap { from } => assert_eq!(from, 9),
            other => panic!("expected gap, got {other:?}"),
        }
        match slow.rx.recv().await.unwrap() {
            StreamItem::Event(e) => assert_eq!(e.sequence, 21),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn dead_subscribers_pruned_on_emit() {
        let bus = EventBus::new(8);
        let sub = bus.subscribe(None);
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        bus.emit(None, ping_kind(0));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
