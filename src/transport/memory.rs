//! In-process broker implementing [`Transport`].
//!
//! State lives behind one mutex; each queue owns a [`Notify`] that wakes waiting consumers
//! when messages arrive or the broker closes.

use super::{Consumer, Delivery, DeliveryToken, QueueSpec, Transport, TransportError};
use crate::messages::{DeadLetter, encode};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug)]
struct Envelope {
    body: Vec<u8>,
    deliveries: u32,
}

#[derive(Debug)]
struct Unacked {
    envelope: Envelope,
    consumer: u64,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Envelope>,
    unacked: HashMap<u64, Unacked>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn push(&mut self, envelope: Envelope) {
        self.ready.push_back(envelope);
        self.notify.notify_one();
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    next_consumer: u64,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory message broker with competing consumers, redelivery, and dead-lettering.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting for delivery.
    pub fn depth(&self, queue: &str) -> Result<usize, TransportError> {
        let state = self.shared.lock();
        state
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))
    }

    /// Number of deliveries handed out but not yet settled.
    pub fn in_flight(&self, queue: &str) -> Result<usize, TransportError> {
        let state = self.shared.lock();
        state
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))
    }

    /// True when none of the named queues hold ready or in-flight messages.
    pub fn is_idle(&self, queues: &[&str]) -> bool {
        let state = self.shared.lock();
        queues.iter().all(|name| {
            state
                .queues
                .get(*name)
                .is_none_or(|q| q.ready.is_empty() && q.unacked.is_empty())
        })
    }

    /// Remove and return every ready message on `queue`, oldest first.
    ///
    /// Used to read terminal queues such as `summary-results` and dead-letter queues that
    /// have no consumer inside this process.
    pub fn drain(&self, queue: &str) -> Result<Vec<Vec<u8>>, TransportError> {
        let mut state = self.shared.lock();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        Ok(q.ready.drain(..).map(|envelope| envelope.body).collect())
    }

    /// Stop the broker: publishes fail and consumers return `None`.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
        tracing::debug!("Broker closed");
    }

    fn settle(
        &self,
        token: &DeliveryToken,
    ) -> Result<(MutexGuard<'_, BrokerState>, Envelope), TransportError> {
        let mut state = self.shared.lock();
        let queue = state
            .queues
            .get_mut(&token.queue)
            .ok_or_else(|| TransportError::UnknownQueue(token.queue.clone()))?;
        let unacked = queue
            .unacked
            .remove(&token.tag)
            .ok_or_else(|| TransportError::UnknownDelivery {
                queue: token.queue.clone(),
                tag: token.tag,
            })?;
        Ok((state, unacked.envelope))
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn declare(&self, spec: QueueSpec) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec == spec => Ok(()),
            Some(_) => Err(TransportError::DeclarationConflict(spec.name)),
            None => {
                tracing::debug!(queue = %spec.name, durable = spec.durable, dead_letter = ?spec.dead_letter, "Declared queue");
                state.queues.insert(spec.name.clone(), QueueState::new(spec));
                Ok(())
            }
        }
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        q.push(Envelope {
            body,
            deliveries: 0,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, TransportError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.next_consumer += 1;
        let id = state.next_consumer;
        let notify = state
            .queues
            .get(queue)
            .map(|q| q.notify.clone())
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        tracing::debug!(queue, consumer = id, "Registered consumer");
        Ok(Box::new(MemoryConsumer {
            shared: self.shared.clone(),
            queue: queue.to_string(),
            id,
            notify,
        }))
    }

    async fn ack(&self, token: &DeliveryToken) -> Result<(), TransportError> {
        self.settle(token).map(|_| ())
    }

    async fn nack(
        &self,
        token: &DeliveryToken,
        requeue: bool,
        reason: &str,
    ) -> Result<(), TransportError> {
        if requeue {
            let (mut state, envelope) = self.settle(token)?;
            if let Some(queue) = state.queues.get_mut(&token.queue) {
                queue.push(envelope);
            }
            return Ok(());
        }

        let target = {
            let state = self.shared.lock();
            let queue = state
                .queues
                .get(&token.queue)
                .ok_or_else(|| TransportError::UnknownQueue(token.queue.clone()))?;
            match &queue.spec.dead_letter {
                Some(target) if !state.queues.contains_key(target) => {
                    return Err(TransportError::UnknownQueue(target.clone()));
                }
                other => other.clone(),
            }
        };

        let (mut state, envelope) = self.settle(token)?;
        let Some(target) = target else {
            tracing::error!(queue = %token.queue, reason, "Rejected message dropped: queue has no dead-letter target");
            return Ok(());
        };
        let letter = DeadLetter::new(&envelope.body, &token.queue, reason, envelope.deliveries);
        let body = match encode(&letter) {
            Ok(body) => body,
            Err(error) => {
                tracing::error!(error = %error, "Failed to encode dead letter; forwarding raw body");
                envelope.body
            }
        };
        if let Some(dlq) = state.queues.get_mut(&target) {
            dlq.push(Envelope {
                body,
                deliveries: 0,
            });
        }
        tracing::warn!(queue = %token.queue, dead_letter = %target, reason, "Message dead-lettered");
        Ok(())
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    queue: String,
    id: u64,
    notify: Arc<Notify>,
}

impl MemoryConsumer {
    fn try_take(&self) -> Result<Option<Delivery>, ()> {
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(());
        }
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Err(());
        };
        let Some(mut envelope) = queue.ready.pop_front() else {
            return Ok(None);
        };
        state.next_tag += 1;
        let tag = state.next_tag;
        envelope.deliveries += 1;
        let delivery = Delivery {
            token: DeliveryToken {
                queue: self.queue.clone(),
                tag,
            },
            body: envelope.body.clone(),
            attempt: envelope.deliveries,
        };
        queue.unacked.insert(
            tag,
            Unacked {
                envelope,
                consumer: self.id,
            },
        );
        if !queue.ready.is_empty() {
            // Wake a sibling consumer for the remaining backlog.
            queue.notify.notify_one();
        }
        Ok(Some(delivery))
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_take() {
                Ok(Some(delivery)) => return Some(delivery),
                Ok(None) => notified.await,
                Err(()) => return None,
            }
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return;
        };
        let mut orphaned: Vec<(u64, Envelope)> = Vec::new();
        let tags: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.consumer == self.id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = queue.unacked.remove(&tag) {
                orphaned.push((tag, unacked.envelope));
            }
        }
        if orphaned.is_empty() {
            return;
        }
        orphaned.sort_by_key(|(tag, _)| *tag);
        tracing::debug!(queue = %self.queue, consumer = self.id, count = orphaned.len(), "Requeueing unacked deliveries");
        for (_, envelope) in orphaned.into_iter().rev() {
            queue.ready.push_front(envelope);
        }
        queue.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn broker_with(queues: &[QueueSpec]) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        for spec in queues {
            broker.declare(spec.clone()).await.expect("declare");
        }
        broker
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let broker = broker_with(&[QueueSpec::durable("q")]).await;
        for body in ["a", "b", "c"] {
            broker.publish("q", body.as_bytes().to_vec()).await.unwrap();
        }
        let mut consumer = broker.consume("q").await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..3 {
            let delivery = consumer.next().await.unwrap();
            seen.push(String::from_utf8(delivery.body.clone()).unwrap());
            broker.ack(&delivery.token).await.unwrap();
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert!(broker.is_idle(&["q"]));
    }

    #[tokio::test]
    async fn publish_to_undeclared_queue_fails() {
        let broker = InMemoryBroker::new();
        let error = broker.publish("missing", Vec::new()).await.unwrap_err();
        assert!(matches!(error, TransportError::UnknownQueue(name) if name == "missing"));
    }

    #[tokio::test]
    async fn redeclare_with_different_settings_conflicts() {
        let broker = broker_with(&[QueueSpec::durable("q")]).await;
        broker.declare(QueueSpec::durable("q")).await.expect("same settings");
        let error = broker
            .declare(QueueSpec::durable("q").with_dead_letter("q.dlq"))
            .await
            .unwrap_err();
        assert!(matches!(error, TransportError::DeclarationConflict(_)));
    }

    #[tokio::test]
    async fn competing_consumers_never_share_a_delivery() {
        let broker = broker_with(&[QueueSpec::durable("q")]).await;
        broker.publish("q", b"one".to_vec()).await.unwrap();
        broker.publish("q", b"two".to_vec()).await.unwrap();
        let mut first = broker.consume("q").await.unwrap();
        let mut second = broker.consume("q").await.unwrap();
        let a = first.next().await.unwrap();
        let b = second.next().await.unwrap();
        assert_ne!(a.body, b.body);
        assert_eq!(broker.in_flight("q").unwrap(), 2);
    }

    #[tokio::test]
    async fn requeue_increments_attempt() {
        let broker = broker_with(&[QueueSpec::durable("q")]).await;
        broker.publish("q", b"x".to_vec()).await.unwrap();
        let mut consumer = broker.consume("q").await.unwrap();

        let first = consumer.next().await.unwrap();
        assert_eq!(first.attempt, 1);
        assert!(!first.redelivered());
        broker.nack(&first.token, true, "busy").await.unwrap();

        let second = consumer.next().await.unwrap();
        assert_eq!(second.attempt, 2);
        assert!(second.redelivered());
    }

    #[tokio::test]
    async fn nack_without_requeue_routes_to_dead_letter_queue() {
        let broker = broker_with(&[
            QueueSpec::durable("q.dlq"),
            QueueSpec::durable("q").with_dead_letter("q.dlq"),
        ])
        .await;
        broker.publish("q", br#"{"filename":"a.pdf"}"#.to_vec()).await.unwrap();
        let mut consumer = broker.consume("q").await.unwrap();
        let delivery = consumer.next().await.unwrap();
        broker
            .nack(&delivery.token, false, "missing documentId")
            .await
            .unwrap();

        let letters = broker.drain("q.dlq").unwrap();
        assert_eq!(letters.len(), 1);
        let letter: DeadLetter = serde_json::from_slice(&letters[0]).unwrap();
        assert_eq!(letter.stage, "q");
        assert_eq!(letter.reason, "missing documentId");
        assert_eq!(letter.attempts, 1);
        assert_eq!(letter.original_message["filename"], "a.pdf");
        assert!(broker.is_idle(&["q"]));
    }

    #[tokio::test]
    async fn settling_twice_is_an_error() {
        let broker = broker_with(&[QueueSpec::durable("q")]).await;
        broker.publish("q", b"x".to_vec()).await.unwrap();
        let mut consumer = broker.consume("q").await.unwrap();
        let delivery = consumer.next().await.unwrap();
        broker.ack(&delivery.token).await.unwrap();
        let error = broker.ack(&delivery.token).await.unwrap_err();
        assert!(matches!(error, TransportError::UnknownDelivery { .. }));
    }

    #[tokio::test]
    async fn dropped_consumer_redelivers_unacked_messages() {
        let broker = broker_with(&[QueueSpec::durable("q")]).await;
        broker.publish("q", b"x".to_vec()).await.unwrap();
        {
            let mut crashed = broker.consume("q").await.unwrap();
            let delivery = crashed.next().await.unwrap();
            assert_eq!(delivery.attempt, 1);
        }
        let mut survivor = broker.consume("q").await.unwrap();
        let redelivered = survivor.next().await.unwrap();
        assert_eq!(redelivered.body, b"x");
        assert_eq!(redelivered.attempt, 2);
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_publish_and_close() {
        let broker = broker_with(&[QueueSpec::durable("q")]).await;
        let mut consumer = broker.consume("q").await.unwrap();
        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("q", b"late".to_vec()).await.unwrap();
        });
        let delivery = tokio::time::timeout(Duration::from_secs(2), consumer.next())
            .await
            .expect("woken by publish")
            .unwrap();
        broker.ack(&delivery.token).await.unwrap();

        let closer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });
        let next = tokio::time::timeout(Duration::from_secs(2), consumer.next())
            .await
            .expect("woken by close");
        assert!(next.is_none());
        assert!(matches!(
            broker.publish("q", Vec::new()).await,
            Err(TransportError::Closed)
        ));
    }
}
