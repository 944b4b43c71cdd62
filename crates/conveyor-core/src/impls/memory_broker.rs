//! In-memory broker.
//!
//! One queue per routing key. Each queue keeps a ready heap ordered by
//! priority (FIFO within a priority) and a scheduled heap of requeued messages
//! waiting out their backoff. Scheduled messages are promoted to ready when a
//! consumer looks for work.
//!
//! Locks are never held across an `.await`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::Instant;
use ulid::Ulid;

use crate::domain::{BrokerError, MessageId, Priority};
use crate::ports::{Broker, Consumer, Delivery, OutboundMessage};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: MessageId,
    body: Vec<u8>,
    priority: Priority,
    persistent: bool,
    attempt: u32,
}

/// Ready entry: higher priority first, then lower sequence first.
#[derive(Debug, Clone)]
struct ReadyEntry {
    seq: u64,
    message: StoredMessage,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Scheduled entry. Reverse ordering so the max-heap yields the earliest due.
#[derive(Debug, Clone)]
struct ScheduledEntry {
    due: Instant,
    seq: u64,
    message: StoredMessage,
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledEntry {}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A message parked after being dead-lettered.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub body: Vec<u8>,
    pub attempt: u32,
    pub reason: String,
}

/// Counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub scheduled: usize,
    pub unacked: usize,
    pub acked: u64,
    pub dead_lettered: usize,
}

impl QueueStats {
    /// Nothing waiting and nothing in flight.
    pub fn is_drained(&self) -> bool {
        self.ready + self.scheduled + self.unacked == 0
    }
}

struct QueueState {
    max_priority: u8,
    ready: BinaryHeap<ReadyEntry>,
    scheduled: BinaryHeap<ScheduledEntry>,
    unacked: usize,
    acked: u64,
    dead: Vec<DeadLetter>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(max_priority: u8) -> Self {
        Self {
            max_priority,
            ready: BinaryHeap::new(),
            scheduled: BinaryHeap::new(),
            unacked: 0,
            acked: 0,
            dead: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Move scheduled messages whose delay has elapsed to the ready heap.
    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.due > now {
                break;
            }
            if let Some(entry) = self.scheduled.pop() {
                self.ready.push(ReadyEntry {
                    seq: entry.seq,
                    message: entry.message,
                });
            }
        }
    }

    fn settle(&mut self) {
        self.unacked = self.unacked.saturating_sub(1);
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            ready: self.ready.len(),
            scheduled: self.scheduled.len(),
            unacked: self.unacked,
            acked: self.acked,
            dead_lettered: self.dead.len(),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_seq: u64,
}

impl BrokerState {
    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Puts a message back on its queue, after `delay` if non-zero.
    fn requeue(&mut self, queue: &str, mut message: StoredMessage, delay: Duration) {
        let seq = self.allocate_seq();
        let Some(state) = self.queues.get_mut(queue) else {
            tracing::warn!(queue, "requeue to a queue that no longer exists, message lost");
            return;
        };
        state.settle();
        message.attempt += 1;
        if delay.is_zero() {
            state.ready.push(ReadyEntry { seq, message });
        } else {
            state.scheduled.push(ScheduledEntry {
                due: Instant::now() + delay,
                seq,
                message,
            });
        }
        state.notify.notify_one();
    }
}

struct Inner {
    state: Mutex<BrokerState>,
    closed_tx: watch::Sender<bool>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Priority-capable broker living in process memory.
///
/// Cloning yields another handle onto the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                closed_tx,
            }),
        }
    }

    /// Closes the broker. Consumers return `None`; publishing fails.
    pub fn close(&self) {
        self.inner.closed_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    pub fn stats(&self, queue: &str) -> Option<QueueStats> {
        self.inner.lock().queues.get(queue).map(QueueState::stats)
    }

    /// Bodies of every message not yet delivered, in delivery order for the
    /// ready part, followed by the scheduled part in due order.
    pub fn pending_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.inner.lock();
        let Some(queue) = state.queues.get(queue) else {
            return Vec::new();
        };
        let mut ready = queue.ready.clone().into_sorted_vec();
        ready.reverse();
        let mut scheduled = queue.scheduled.clone().into_sorted_vec();
        scheduled.reverse();
        ready
            .into_iter()
            .map(|entry| entry.message.body)
            .chain(scheduled.into_iter().map(|entry| entry.message.body))
            .collect()
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<DeadLetter> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|queue| queue.dead.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, name: &str, max_priority: u8) -> Result<(), BrokerError> {
        let mut state = self.inner.lock();
        match state.queues.get(name) {
            Some(existing) if existing.max_priority != max_priority => {
                Err(BrokerError::QueueMismatch {
                    queue: name.to_string(),
                    declared: existing.max_priority,
                })
            }
            Some(_) => Ok(()),
            None => {
                tracing::debug!(queue = name, max_priority, "declared queue");
                state
                    .queues
                    .insert(name.to_string(), QueueState::new(max_priority));
                Ok(())
            }
        }
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let mut state = self.inner.lock();
        let seq = state.allocate_seq();
        let Some(queue) = state.queues.get_mut(&message.routing_key) else {
            if message.mandatory {
                return Err(BrokerError::Unroutable(message.routing_key));
            }
            tracing::debug!(routing_key = %message.routing_key, "dropped unroutable message");
            return Ok(());
        };

        let stored = StoredMessage {
            id: MessageId::from(Ulid::new()),
            body: message.body,
            priority: Priority::clamped(message.priority.get(), queue.max_priority),
            persistent: message.persistent,
            attempt: 1,
        };
        tracing::trace!(
            queue = %message.routing_key,
            message_id = %stored.id,
            priority = %stored.priority,
            persistent = stored.persistent,
            "accepted message"
        );
        queue.ready.push(ReadyEntry {
            seq,
            message: stored,
        });
        queue.notify.notify_one();
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Consumer>, BrokerError> {
        let notify = {
            let state = self.inner.lock();
            let Some(state) = state.queues.get(queue) else {
                return Err(BrokerError::UnknownQueue(queue.to_string()));
            };
            Arc::clone(&state.notify)
        };
        Ok(Box::new(InMemoryConsumer {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            notify,
            prefetch: (prefetch > 0).then(|| Arc::new(Semaphore::new(usize::from(prefetch)))),
            closed_rx: self.inner.closed_tx.subscribe(),
        }))
    }
}

struct InMemoryConsumer {
    inner: Arc<Inner>,
    queue: String,
    notify: Arc<Notify>,
    prefetch: Option<Arc<Semaphore>>,
    closed_rx: watch::Receiver<bool>,
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    // The sender lives as long as the broker; an error means it is gone.
    let _ = rx.wait_for(|closed| *closed).await;
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn next(&mut self) -> Option<Box<dyn Delivery>> {
        // Prefetch budget first: a consumer at its limit takes nothing.
        let permit = match &self.prefetch {
            Some(semaphore) => tokio::select! {
                permit = Arc::clone(semaphore).acquire_owned() => Some(permit.ok()?),
                _ = wait_closed(&mut self.closed_rx) => return None,
            },
            None => None,
        };

        let notify = Arc::clone(&self.notify);
        loop {
            if *self.closed_rx.borrow() {
                return None;
            }

            // Registered before the queue is checked, so a publish landing in
            // between still wakes this consumer.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.inner.lock();
                let queue = state.queues.get_mut(&self.queue)?;
                queue.promote_due(Instant::now());
                if let Some(entry) = queue.ready.pop() {
                    queue.unacked += 1;
                    return Some(Box::new(InMemoryDelivery {
                        inner: Arc::clone(&self.inner),
                        queue: self.queue.clone(),
                        message: Some(entry.message),
                        _permit: permit,
                    }));
                }
                queue.scheduled.peek().map(|entry| entry.due)
            };

            let until_due = async move {
                match next_due {
                    Some(due) => tokio::time::sleep_until(due).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = until_due => {}
                _ = wait_closed(&mut self.closed_rx) => return None,
            }
        }
    }
}

struct InMemoryDelivery {
    inner: Arc<Inner>,
    queue: String,
    message: Option<StoredMessage>,
    // Released when the delivery is settled or dropped.
    _permit: Option<OwnedSemaphorePermit>,
}

impl InMemoryDelivery {
    fn take(&mut self) -> Result<StoredMessage, BrokerError> {
        self.message
            .take()
            .ok_or_else(|| BrokerError::UnknownQueue(self.queue.clone()))
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn body(&self) -> &[u8] {
        self.message
            .as_ref()
            .map_or(&[][..], |message| message.body.as_slice())
    }

    fn attempt(&self) -> u32 {
        self.message.as_ref().map_or(0, |message| message.attempt)
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn ack(mut self: Box<Self>) -> Result<(), BrokerError> {
        self.take()?;
        let mut state = self.inner.lock();
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::UnknownQueue(self.queue.clone()))?;
        queue.settle();
        queue.acked += 1;
        Ok(())
    }

    async fn requeue(mut self: Box<Self>, delay: Duration) -> Result<(), BrokerError> {
        let message = self.take()?;
        self.inner.lock().requeue(&self.queue, message, delay);
        Ok(())
    }

    async fn dead_letter(mut self: Box<Self>, reason: String) -> Result<(), BrokerError> {
        let message = self.take()?;
        let mut state = self.inner.lock();
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::UnknownQueue(self.queue.clone()))?;
        queue.settle();
        queue.dead.push(DeadLetter {
            message_id: message.id,
            body: message.body,
            attempt: message.attempt,
            reason,
        });
        Ok(())
    }
}

impl Drop for InMemoryDelivery {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            tracing::warn!(
                queue = %self.queue,
                message_id = %message.id,
                "delivery dropped without settlement, requeueing"
            );
            self.inner.lock().requeue(&self.queue, message, Duration::ZERO);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn message(queue: &str, body: &str, priority: u8) -> OutboundMessage {
        OutboundMessage {
            routing_key: queue.to_string(),
            body: body.as_bytes().to_vec(),
            priority: Priority::new(priority, 10).unwrap(),
            persistent: true,
            mandatory: true,
        }
    }

    async fn broker_with(queue: &str) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare_queue(queue, 10).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn higher_priority_is_delivered_first_then_fifo() {
        let broker = broker_with("ingest").await;
        for (body, priority) in [("low", 2), ("high-a", 9), ("mid", 5), ("high-b", 9)] {
            broker.publish(message("ingest", body, priority)).await.unwrap();
        }

        let mut consumer = broker.consume("ingest", 0).await.unwrap();
        let mut order = Vec::new();
        for _ in 0..4 {
            let delivery = consumer.next().await.unwrap();
            order.push(String::from_utf8(delivery.body().to_vec()).unwrap());
            delivery.ack().await.unwrap();
        }
        assert_eq!(order, vec!["high-a", "high-b", "mid", "low"]);
        assert_eq!(broker.stats("ingest").unwrap().acked, 4);
    }

    #[tokio::test]
    async fn mandatory_publish_to_unbound_key_is_unroutable() {
        let broker = broker_with("ingest").await;
        let err = broker.publish(message("ocr", "x", 1)).await.unwrap_err();
        assert_eq!(err, BrokerError::Unroutable("ocr".to_string()));

        let mut optional = message("ocr", "x", 1);
        optional.mandatory = false;
        broker.publish(optional).await.unwrap();
        assert!(broker.stats("ocr").is_none());
    }

    #[tokio::test]
    async fn redeclare_with_other_priority_is_rejected() {
        let broker = broker_with("ingest").await;
        broker.declare_queue("ingest", 10).await.unwrap();
        let err = broker.declare_queue("ingest", 5).await.unwrap_err();
        assert!(matches!(err, BrokerError::QueueMismatch { declared: 10, .. }));
    }

    #[tokio::test]
    async fn consuming_an_undeclared_queue_fails() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.consume("analyze", 1).await,
            Err(BrokerError::UnknownQueue(_))
        ));
    }

    #[tokio::test]
    async fn prefetch_bounds_unsettled_deliveries() {
        let broker = broker_with("analyze").await;
        broker.publish(message("analyze", "a", 1)).await.unwrap();
        broker.publish(message("analyze", "b", 1)).await.unwrap();

        let mut consumer = broker.consume("analyze", 1).await.unwrap();
        let first = consumer.next().await.unwrap();
        assert!(
            timeout(Duration::from_millis(50), consumer.next())
                .await
                .is_err(),
            "second delivery must wait for the first to settle"
        );
        assert_eq!(broker.stats("analyze").unwrap().unacked, 1);

        first.ack().await.unwrap();
        let second = timeout(Duration::from_secs(1), consumer.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.body(), b"b");
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_with_delay_redelivers_later_with_next_attempt() {
        let broker = broker_with("ingest").await;
        broker.publish(message("ingest", "job", 3)).await.unwrap();
        let mut consumer = broker.consume("ingest", 0).await.unwrap();

        let delivery = consumer.next().await.unwrap();
        assert_eq!(delivery.attempt(), 1);
        delivery.requeue(Duration::from_secs(4)).await.unwrap();

        let stats = broker.stats("ingest").unwrap();
        assert_eq!((stats.ready, stats.scheduled, stats.unacked), (0, 1, 0));

        let started = Instant::now();
        let again = consumer.next().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert_eq!(again.attempt(), 2);
        assert_eq!(again.body(), b"job");
    }

    #[tokio::test]
    async fn dead_letters_are_kept_for_inspection() {
        let broker = broker_with("ingest").await;
        broker.publish(message("ingest", "poison", 1)).await.unwrap();
        let mut consumer = broker.consume("ingest", 1).await.unwrap();

        let delivery = consumer.next().await.unwrap();
        delivery.dead_letter("bad body".to_string()).await.unwrap();

        let dead = broker.dead_letters("ingest");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].body, b"poison");
        assert_eq!(dead[0].reason, "bad body");
        assert!(broker.stats("ingest").unwrap().is_drained());
    }

    #[tokio::test]
    async fn dropped_delivery_goes_back_to_the_queue() {
        let broker = broker_with("ingest").await;
        broker.publish(message("ingest", "m", 1)).await.unwrap();
        let mut consumer = broker.consume("ingest", 1).await.unwrap();

        drop(consumer.next().await.unwrap());

        let again = timeout(Duration::from_secs(1), consumer.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.attempt(), 2);
    }

    #[tokio::test]
    async fn closing_stops_consumers_and_publishers() {
        let broker = broker_with("ingest").await;
        let mut consumer = broker.consume("ingest", 1).await.unwrap();
        let waiting = tokio::spawn(async move { consumer.next().await.is_none() });

        tokio::task::yield_now().await;
        broker.close();

        assert!(waiting.await.unwrap());
        assert_eq!(
            broker.publish(message("ingest", "late", 1)).await,
            Err(BrokerError::Closed)
        );
    }

    #[tokio::test]
    async fn priority_above_queue_maximum_is_clamped() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("ingest", 3).await.unwrap();
        broker.publish(message("ingest", "first", 3)).await.unwrap();
        broker.publish(message("ingest", "second", 9)).await.unwrap();

        // Both sit at priority 3, so FIFO applies.
        let bodies = broker.pending_bodies("ingest");
        assert_eq!(bodies, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test]
    async fn back_to_back_publishes_wake_every_idle_consumer() {
        let broker = broker_with("ingest").await;
        let mut waiting = Vec::new();
        for _ in 0..2 {
            let mut consumer = broker.consume("ingest", 1).await.unwrap();
            waiting.push(tokio::spawn(async move {
                let delivery = consumer.next().await?;
                let body = delivery.body().to_vec();
                delivery.ack().await.ok()?;
                Some(body)
            }));
        }
        tokio::task::yield_now().await;

        broker.publish(message("ingest", "a", 1)).await.unwrap();
        broker.publish(message("ingest", "b", 1)).await.unwrap();

        let mut bodies = Vec::new();
        for consumer in waiting {
            let body = timeout(Duration::from_secs(1), consumer)
                .await
                .expect("idle consumer was not woken")
                .unwrap();
            bodies.push(body.unwrap());
        }
        bodies.sort();
        assert_eq!(bodies, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
