//! Delivery tracker — pending-ack and pending-response bookkeeping
//!
//! Every message handed to a consumer with a pending acknowledge, and
//! every request awaiting a response, is followed here until it resolves,
//! times out, or its consumer disconnects. A single timer task pops
//! expired records and hands each back to the owner that followed it
//! (a queue actor or the broker) through the sender supplied at follow
//! time. Records that resolve after expiry are gone from the map, so
//! late acknowledgements are ignored.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::sync::mpsc;

use crate::message::Message;

/// What the tracked delivery is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Acknowledge,
    Response,
}

/// In-memory entry for a message awaiting ack or response
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    /// The delivered message (kept for requeue and negative-ack paths)
    pub message: Message,
    pub message_id: String,
    /// Owning queue, `None` for direct-message response tracking
    pub queue_name: Option<String>,
    /// Consumer the message was handed to
    pub consumer_id: String,
    /// Producer to forward the resolution to, when it awaits one
    pub producer_id: Option<String>,
    pub kind: TrackKind,
    pub sent_at: Instant,
}

impl DeliveryRecord {
    /// Record for a queue delivery awaiting a consumer acknowledge
    pub fn for_ack(
        message: Message,
        queue_name: &str,
        consumer_id: &str,
        producer_id: Option<String>,
    ) -> Self {
        Self {
            message_id: message.id.clone(),
            message,
            queue_name: Some(queue_name.to_string()),
            consumer_id: consumer_id.to_string(),
            producer_id,
            kind: TrackKind::Acknowledge,
            sent_at: Instant::now(),
        }
    }

    /// Record for a request awaiting a correlated response
    pub fn for_response(message: Message, responder_id: &str, requester_id: &str) -> Self {
        Self {
            message_id: message.id.clone(),
            message,
            queue_name: None,
            consumer_id: responder_id.to_string(),
            producer_id: Some(requester_id.to_string()),
            kind: TrackKind::Response,
            sent_at: Instant::now(),
        }
    }
}

/// Channel on which an owner receives its expired records
pub type ExpirySender = mpsc::UnboundedSender<DeliveryRecord>;

struct Tracked {
    record: DeliveryRecord,
    seq: u64,
    expiry: ExpirySender,
}

#[derive(Default)]
struct TrackerInner {
    records: HashMap<String, Tracked>,
    /// Min-heap of (deadline, insertion seq, message id). The seq gives
    /// FIFO order for equal deadlines and invalidates stale heap entries
    /// after a record is replaced.
    heap: BinaryHeap<Reverse<(Instant, u64, String)>>,
    next_seq: u64,
}

/// Shared tracker with a single timer task
#[derive(Clone)]
pub struct DeliveryTracker {
    inner: Arc<Mutex<TrackerInner>>,
    wake: Arc<tokio::sync::Notify>,
}

impl DeliveryTracker {
    /// Create a tracker and spawn its timer task. The task exits once
    /// every tracker clone is dropped.
    pub fn new() -> Self {
        let tracker = Self {
            inner: Arc::new(Mutex::new(TrackerInner::default())),
            wake: Arc::new(tokio::sync::Notify::new()),
        };
        tokio::spawn(timer_loop(
            Arc::downgrade(&tracker.inner),
            tracker.wake.clone(),
        ));
        tracker
    }

    /// Follow a delivery until `deadline`. Expired records are sent to
    /// `expiry`. A record with the same message id is replaced.
    pub fn follow(&self, record: DeliveryRecord, deadline: Instant, expiry: ExpirySender) {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let id = record.message_id.clone();
        inner.heap.push(Reverse((deadline, seq, id.clone())));
        inner.records.insert(
            id,
            Tracked {
                record,
                seq,
                expiry,
            },
        );
        drop(inner);
        self.wake.notify_one();
    }

    /// Resolve a pending acknowledge. Returns `None` for unknown or
    /// already-expired ids.
    pub fn resolve_ack(&self, message_id: &str) -> Option<DeliveryRecord> {
        self.take(message_id, TrackKind::Acknowledge)
    }

    /// Resolve a pending response. Returns `None` for unknown or
    /// already-expired ids.
    pub fn resolve_response(&self, message_id: &str) -> Option<DeliveryRecord> {
        self.take(message_id, TrackKind::Response)
    }

    /// Queue owning the tracked delivery, if any
    pub fn queue_of(&self, message_id: &str) -> Option<String> {
        let inner = self.inner.lock().expect("tracker lock poisoned");
        inner
            .records
            .get(message_id)
            .and_then(|tracked| tracked.record.queue_name.clone())
    }

    /// Drop every record addressed to a disconnected consumer,
    /// returning them without firing timeouts
    pub fn cancel_by_consumer(&self, consumer_id: &str) -> Vec<DeliveryRecord> {
        self.cancel_where(|record| record.consumer_id == consumer_id)
    }

    /// Drop every record owned by a queue, returning them without
    /// firing timeouts
    pub fn cancel_by_queue(&self, queue_name: &str) -> Vec<DeliveryRecord> {
        self.cancel_where(|record| record.queue_name.as_deref() == Some(queue_name))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("tracker lock poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, message_id: &str, kind: TrackKind) -> Option<DeliveryRecord> {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        match inner.records.get(message_id) {
            Some(tracked) if tracked.record.kind == kind => {}
            _ => return None,
        }
        inner
            .records
            .remove(message_id)
            .map(|tracked| tracked.record)
    }

    fn cancel_where(&self, predicate: impl Fn(&DeliveryRecord) -> bool) -> Vec<DeliveryRecord> {
        let mut inner = self.inner.lock().expect("tracker lock poisoned");
        let ids: Vec<String> = inner
            .records
            .iter()
            .filter(|(_, tracked)| predicate(&tracked.record))
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| inner.records.remove(&id).map(|tracked| tracked.record))
            .collect()
    }
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Idle poll interval; bounds how long the task outlives its tracker
const IDLE_TICK: std::time::Duration = std::time::Duration::from_millis(500);

async fn timer_loop(inner: Weak<Mutex<TrackerInner>>, wake: Arc<tokio::sync::Notify>) {
    loop {
        let next_deadline = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut inner = inner.lock().expect("tracker lock poisoned");
            let now = Instant::now();
            let mut expired = Vec::new();
            while let Some(Reverse((deadline, seq, id))) = inner.heap.peek().cloned() {
                if deadline > now {
                    break;
                }
                inner.heap.pop();
                // Stale heap entries (resolved or replaced records) are skipped
                let live = matches!(inner.records.get(&id), Some(tracked) if tracked.seq == seq);
                if live {
                    if let Some(tracked) = inner.records.remove(&id) {
                        expired.push(tracked);
                    }
                }
            }
            for tracked in expired {
                let _ = tracked.expiry.send(tracked.record);
            }
            inner.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
        };

        let sleep_until = match next_deadline {
            Some(deadline) => deadline.min(Instant::now() + IDLE_TICK),
            None => Instant::now() + IDLE_TICK,
        };
        tokio::select! {
            _ = tokio::time::sleep_until(sleep_until.into()) => {}
            _ = wake.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(id: &str, consumer: &str, queue: &str) -> DeliveryRecord {
        let mut message = Message::queue(queue, 1);
        message.set_id(id);
        DeliveryRecord::for_ack(message, queue, consumer, Some("producer-1".to_string()))
    }

    #[tokio::test]
    async fn test_expiry_fires_once() {
        let tracker = DeliveryTracker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        tracker.follow(
            record("m1", "c1", "orders"),
            Instant::now() + Duration::from_millis(30),
            tx,
        );

        let expired = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired.message_id, "m1");
        assert!(tracker.is_empty());

        // Late ack after expiry is ignored
        assert!(tracker.resolve_ack("m1").is_none());
    }

    #[tokio::test]
    async fn test_resolve_before_deadline_suppresses_expiry() {
        let tracker = DeliveryTracker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        tracker.follow(
            record("m1", "c1", "orders"),
            Instant::now() + Duration::from_millis(50),
            tx,
        );
        let resolved = tracker.resolve_ack("m1").unwrap();
        assert_eq!(resolved.consumer_id, "c1");

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resolve_kind_mismatch() {
        let tracker = DeliveryTracker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        tracker.follow(
            record("m1", "c1", "orders"),
            Instant::now() + Duration::from_secs(5),
            tx,
        );

        assert!(tracker.resolve_response("m1").is_none());
        assert!(tracker.resolve_ack("m1").is_some());
    }

    #[tokio::test]
    async fn test_equal_deadlines_expire_in_insertion_order() {
        let tracker = DeliveryTracker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let deadline = Instant::now() + Duration::from_millis(30);

        for id in ["m1", "m2", "m3"] {
            tracker.follow(record(id, "c1", "orders"), deadline, tx.clone());
        }

        let mut order = Vec::new();
        for _ in 0..3 {
            let expired = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            order.push(expired.message_id);
        }
        assert_eq!(order, ["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_cancel_by_consumer() {
        let tracker = DeliveryTracker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let deadline = Instant::now() + Duration::from_millis(40);

        tracker.follow(record("m1", "c1", "orders"), deadline, tx.clone());
        tracker.follow(record("m2", "c2", "orders"), deadline, tx.clone());
        tracker.follow(record("m3", "c1", "billing"), deadline, tx);

        let canceled = tracker.cancel_by_consumer("c1");
        assert_eq!(canceled.len(), 2);
        assert_eq!(tracker.len(), 1);

        // Only the surviving record expires
        let expired = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired.message_id, "m2");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_by_queue_and_queue_of() {
        let tracker = DeliveryTracker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let deadline = Instant::now() + Duration::from_secs(5);

        tracker.follow(record("m1", "c1", "orders"), deadline, tx.clone());
        tracker.follow(record("m2", "c1", "billing"), deadline, tx);

        assert_eq!(tracker.queue_of("m1").as_deref(), Some("orders"));
        assert_eq!(tracker.cancel_by_queue("orders").len(), 1);
        assert!(tracker.queue_of("m1").is_none());
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_refollow_replaces_record() {
        let tracker = DeliveryTracker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        tracker.follow(
            record("m1", "c1", "orders"),
            Instant::now() + Duration::from_millis(30),
            tx.clone(),
        );
        tracker.follow(
            record("m1", "c2", "orders"),
            Instant::now() + Duration::from_millis(90),
            tx,
        );

        let expired = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        // The stale first deadline did not fire the replaced record
        assert_eq!(expired.consumer_id, "c2");
    }
}
