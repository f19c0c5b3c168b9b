//! In-process durable queue with AMQP-style acknowledgement
//!
//! Implements the same publisher and delivery-source seams as the AMQP
//! relay so the pipeline and the worker can run without a live broker.
//! Deliveries stay unacked until settled; when a consumer goes away its
//! unacked deliveries return to the head of the queue flagged as redelivered,
//! with their attempt count untouched. A retry is a fresh message at the tail
//! carrying the raised count, the same as an AMQP republish.

use crate::domain::types::GeofenceEvent;
use crate::io::consumer::{ConsumeError, Delivery, DeliverySource};
use crate::io::relay::{EventPublisher, RelayError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Message {
    tag: u64,
    body: Bytes,
    redelivered: bool,
    attempts: u32,
}

#[derive(Default)]
struct State {
    ready: VecDeque<Message>,
    /// delivery tag -> (consumer id, message)
    unacked: FxHashMap<u64, (u64, Message)>,
    next_tag: u64,
    next_consumer: u64,
    unavailable: bool,
}

impl State {
    fn requeue_front(&mut self, mut message: Message) {
        message.redelivered = true;
        self.ready.push_front(message);
    }

    fn push_back(&mut self, body: Bytes, attempts: u32) {
        self.next_tag += 1;
        let tag = self.next_tag;
        self.ready.push_back(Message { tag, body, redelivered: false, attempts });
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

/// Cloneable handle to one in-memory queue
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an arbitrary body, bypassing serialization
    pub fn publish_raw(&self, body: impl Into<Bytes>) {
        self.shared.state.lock().push_back(body.into(), 0);
        self.shared.notify.notify_one();
    }

    /// Make subsequent publishes fail with `RelayError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.state.lock().unavailable = unavailable;
    }

    pub fn subscribe(&self) -> MemoryConsumer {
        let mut state = self.shared.state.lock();
        state.next_consumer += 1;
        MemoryConsumer { id: state.next_consumer, shared: self.shared.clone() }
    }

    /// Messages waiting to be delivered
    pub fn ready_len(&self) -> usize {
        self.shared.state.lock().ready.len()
    }

    /// Messages delivered but not yet settled
    pub fn unacked_len(&self) -> usize {
        self.shared.state.lock().unacked.len()
    }

    /// Decoded copies of every ready message, head first
    pub fn ready_events(&self) -> Vec<GeofenceEvent> {
        self.shared
            .state
            .lock()
            .ready
            .iter()
            .filter_map(|m| serde_json::from_slice(&m.body).ok())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryBroker {
    async fn publish(&self, event: &GeofenceEvent) -> Result<(), RelayError> {
        if self.shared.state.lock().unavailable {
            return Err(RelayError::Unavailable);
        }
        let body = serde_json::to_vec(event)?;
        self.publish_raw(body);
        Ok(())
    }
}

/// Consumer attached to a `MemoryBroker`
pub struct MemoryConsumer {
    id: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl DeliverySource for MemoryConsumer {
    type Delivery = MemoryDelivery;

    async fn next_delivery(&mut self) -> Option<Result<MemoryDelivery, ConsumeError>> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if let Some(message) = state.ready.pop_front() {
                    state.unacked.insert(message.tag, (self.id, message.clone()));
                    return Some(Ok(MemoryDelivery {
                        tag: message.tag,
                        body: message.body,
                        redelivered: message.redelivered,
                        attempts: message.attempts,
                        shared: self.shared.clone(),
                    }));
                }
            }
            self.shared.notify.notified().await;
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        let mut orphaned: Vec<Message> = state
            .unacked
            .values()
            .filter(|(owner, _)| *owner == self.id)
            .map(|(_, message)| message.clone())
            .collect();
        if orphaned.is_empty() {
            return;
        }
        // Oldest first at the head of the queue
        orphaned.sort_by_key(|m| std::cmp::Reverse(m.tag));
        for message in orphaned {
            state.unacked.remove(&message.tag);
            state.requeue_front(message);
        }
        drop(state);
        self.shared.notify.notify_one();
    }
}

/// Delivery handed out by a `MemoryConsumer`
pub struct MemoryDelivery {
    tag: u64,
    body: Bytes,
    redelivered: bool,
    attempts: u32,
    shared: Arc<Shared>,
}

impl MemoryDelivery {
    fn settle(&self) -> Result<Message, ConsumeError> {
        self.shared
            .state
            .lock()
            .unacked
            .remove(&self.tag)
            .map(|(_, message)| message)
            .ok_or_else(|| ConsumeError::Channel(format!("unknown delivery tag {}", self.tag)))
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    async fn ack(&self) -> Result<(), ConsumeError> {
        self.settle().map(|_| ())
    }

    async fn discard(&self) -> Result<(), ConsumeError> {
        self.settle().map(|_| ())
    }

    async fn retry(&self) -> Result<(), ConsumeError> {
        let message = self.settle()?;
        self.shared.state.lock().push_back(message.body, message.attempts.saturating_add(1));
        self.shared.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::PositionRecord;

    fn event(ts: i64) -> GeofenceEvent {
        GeofenceEvent::entry(&PositionRecord::new("B1234XYZ", -6.1938, 106.8230, ts))
    }

    #[tokio::test]
    async fn test_fifo_delivery() {
        let broker = MemoryBroker::new();
        broker.publish(&event(1)).await.unwrap();
        broker.publish(&event(2)).await.unwrap();
        assert_eq!(broker.ready_events(), vec![event(1), event(2)]);

        let mut consumer = broker.subscribe();
        let first = consumer.next_delivery().await.unwrap().unwrap();
        let second = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(serde_json::from_slice::<GeofenceEvent>(first.body()).unwrap(), event(1));
        assert_eq!(serde_json::from_slice::<GeofenceEvent>(second.body()).unwrap(), event(2));
        assert_eq!(broker.unacked_len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_rejects_publish() {
        let broker = MemoryBroker::new();
        broker.set_unavailable(true);
        assert!(matches!(broker.publish(&event(1)).await, Err(RelayError::Unavailable)));
        assert_eq!(broker.ready_len(), 0);

        broker.set_unavailable(false);
        broker.publish(&event(1)).await.unwrap();
        assert_eq!(broker.ready_len(), 1);
    }

    #[tokio::test]
    async fn test_double_ack_is_an_error() {
        let broker = MemoryBroker::new();
        broker.publish(&event(1)).await.unwrap();
        let mut consumer = broker.subscribe();
        let delivery = consumer.next_delivery().await.unwrap().unwrap();
        delivery.ack().await.unwrap();
        assert!(delivery.ack().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_consumer_requeues_in_original_order() {
        let broker = MemoryBroker::new();
        for ts in 1..=3 {
            broker.publish(&event(ts)).await.unwrap();
        }
        let mut consumer = broker.subscribe();
        let _a = consumer.next_delivery().await.unwrap().unwrap();
        let b = consumer.next_delivery().await.unwrap().unwrap();
        b.ack().await.unwrap();
        let _c = consumer.next_delivery().await.unwrap().unwrap();
        drop(consumer);

        assert_eq!(broker.ready_events(), vec![event(1), event(3)]);
        let mut next = broker.subscribe();
        assert!(next.next_delivery().await.unwrap().unwrap().redelivered());
    }

    #[tokio::test]
    async fn test_waiting_consumer_woken_by_publish() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.subscribe();
        let waiter = tokio::spawn(async move {
            let delivery = consumer.next_delivery().await.unwrap().unwrap();
            serde_json::from_slice::<GeofenceEvent>(delivery.body()).unwrap()
        });
        tokio::task::yield_now().await;
        broker.publish(&event(9)).await.unwrap();
        assert_eq!(waiter.await.unwrap(), event(9));
    }

    #[tokio::test]
    async fn test_retry_goes_to_tail_with_raised_attempts() {
        let broker = MemoryBroker::new();
        broker.publish(&event(1)).await.unwrap();
        broker.publish(&event(2)).await.unwrap();
        let mut consumer = broker.subscribe();

        let first = consumer.next_delivery().await.unwrap().unwrap();
        first.retry().await.unwrap();
        assert_eq!(broker.ready_events(), vec![event(2), event(1)]);
        assert_eq!(broker.unacked_len(), 0);

        let second = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(second.attempts(), 0);
        second.ack().await.unwrap();
        let retried = consumer.next_delivery().await.unwrap().unwrap();
        assert_eq!(retried.attempts(), 1);
        assert!(!retried.redelivered());
    }

    #[tokio::test]
    async fn test_dropped_consumer_keeps_attempt_count() {
        let broker = MemoryBroker::new();
        broker.publish(&event(1)).await.unwrap();
        let mut consumer = broker.subscribe();
        consumer.next_delivery().await.unwrap().unwrap().retry().await.unwrap();
        let _taken = consumer.next_delivery().await.unwrap().unwrap();
        drop(consumer);

        let mut next = broker.subscribe();
        let delivery = next.next_delivery().await.unwrap().unwrap();
        assert!(delivery.redelivered());
        assert_eq!(delivery.attempts(), 1);
    }
}
