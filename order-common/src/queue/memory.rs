use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::{Acknowledge, Delivery, Message, Publisher, QueueError, Subscription};

/// An in-process broker with at-least-once semantics: a pulled message stays
/// in flight until acked, a nack puts it back at the head of the topic, and
/// [`MemoryQueue::redeliver_unacked`] simulates a consumer crash.
///
/// Each topic has a single shared cursor, so every subscription on a topic
/// behaves like a member of the same consumer group.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    topics: Arc<Mutex<HashMap<String, Arc<Topic>>>>,
}

#[derive(Default)]
struct Topic {
    state: Mutex<TopicState>,
    notify: Notify,
}

#[derive(Default)]
struct TopicState {
    pending: VecDeque<Entry>,
    in_flight: HashMap<u64, Entry>,
    next_id: u64,
    acked: usize,
    unavailable: bool,
}

#[derive(Clone)]
struct Entry {
    id: u64,
    payload: Bytes,
    published_at: DateTime<Utc>,
}

impl Topic {
    fn lock(&self) -> Result<MutexGuard<'_, TopicState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Unavailable("poisoned memory queue".to_owned()))
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        let mut topics = match self.topics.lock() {
            Ok(topics) => topics,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics.entry(name.to_owned()).or_default().clone()
    }

    pub fn subscribe(&self, topic: &str, poll_timeout: Duration) -> MemorySubscription {
        MemorySubscription {
            topic: self.topic(topic),
            poll_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, topic: &str, payload: Bytes) {
        let topic = self.topic(topic);
        if let Ok(mut state) = topic.lock() {
            let id = state.next_id;
            state.next_id += 1;
            state.pending.push_back(Entry {
                id,
                payload,
                published_at: Utc::now(),
            });
        }
        topic.notify.notify_one();
    }

    /// Messages waiting to be pulled.
    pub fn pending(&self, topic: &str) -> usize {
        self.topic(topic).lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    /// Messages pulled but not settled yet.
    pub fn in_flight(&self, topic: &str) -> usize {
        self.topic(topic)
            .lock()
            .map(|s| s.in_flight.len())
            .unwrap_or(0)
    }

    pub fn acked(&self, topic: &str) -> usize {
        self.topic(topic).lock().map(|s| s.acked).unwrap_or(0)
    }

    /// Return every in-flight message to the head of the topic, as the broker
    /// does when a consumer dies before acking. Returns how many were requeued.
    pub fn redeliver_unacked(&self, topic: &str) -> usize {
        let topic = self.topic(topic);
        let requeued = match topic.lock() {
            Ok(mut state) => {
                let mut entries: Vec<Entry> = state.in_flight.drain().map(|(_, e)| e).collect();
                entries.sort_by_key(|e| e.id);
                let requeued = entries.len();
                for entry in entries.into_iter().rev() {
                    state.pending.push_front(entry);
                }
                requeued
            }
            Err(_) => 0,
        };
        topic.notify.notify_one();
        requeued
    }

    /// Simulate a broker outage: pulls fail with `QueueError::Unavailable`.
    pub fn set_unavailable(&self, topic: &str, unavailable: bool) {
        if let Ok(mut state) = self.topic(topic).lock() {
            state.unavailable = unavailable;
        }
    }
}

#[async_trait]
impl Publisher for MemoryQueue {
    async fn publish(
        &self,
        topic: &str,
        _key: Option<&str>,
        payload: Bytes,
    ) -> Result<(), QueueError> {
        if self.topic(topic).lock()?.unavailable {
            return Err(QueueError::PublishFailed("topic unavailable".to_owned()));
        }
        self.push(topic, payload);
        Ok(())
    }
}

pub struct MemorySubscription {
    topic: Arc<Topic>,
    poll_timeout: Duration,
    closed: AtomicBool,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn pull(&self) -> Result<Option<Message>, QueueError> {
        let deadline = tokio::time::Instant::now() + self.poll_timeout;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }

            {
                let mut state = self.topic.lock()?;
                if state.unavailable {
                    return Err(QueueError::Unavailable("memory queue is down".to_owned()));
                }
                if let Some(entry) = state.pending.pop_front() {
                    let message = Message {
                        payload: entry.payload.clone(),
                        published_at: Some(entry.published_at),
                        delivery: Delivery::new(
                            entry.id.to_string(),
                            Box::new(MemoryDelivery {
                                topic: self.topic.clone(),
                                id: entry.id,
                            }),
                        ),
                    };
                    state.in_flight.insert(entry.id, entry);
                    return Ok(Some(message));
                }
            }

            if tokio::time::timeout_at(deadline, self.topic.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryDelivery {
    topic: Arc<Topic>,
    id: u64,
}

impl MemoryDelivery {
    fn stale(&self) -> QueueError {
        QueueError::SettleFailed {
            id: self.id.to_string(),
            error: "message is no longer in flight".to_owned(),
        }
    }
}

impl Acknowledge for MemoryDelivery {
    fn ack(self: Box<Self>) -> Result<(), QueueError> {
        let mut state = self.topic.lock()?;
        match state.in_flight.remove(&self.id) {
            Some(_) => {
                state.acked += 1;
                Ok(())
            }
            None => Err(self.stale()),
        }
    }

    fn nack(self: Box<Self>) -> Result<(), QueueError> {
        {
            let mut state = self.topic.lock()?;
            let entry = state.in_flight.remove(&self.id).ok_or_else(|| self.stale())?;
            state.pending.push_front(entry);
        }
        self.topic.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "orders";

    #[tokio::test]
    async fn test_pull_times_out_when_empty() {
        let queue = MemoryQueue::new();
        let subscription = queue.subscribe(TOPIC, Duration::from_millis(20));

        assert!(subscription.pull().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ack_settles_message() {
        let queue = MemoryQueue::new();
        let subscription = queue.subscribe(TOPIC, Duration::from_millis(100));
        queue
            .publish(TOPIC, None, Bytes::from_static(b"one"))
            .await
            .unwrap();

        let message = subscription.pull().await.unwrap().expect("no message");
        assert_eq!(message.payload, Bytes::from_static(b"one"));
        assert!(message.published_at.is_some());
        assert_eq!(queue.in_flight(TOPIC), 1);

        message.delivery.ack().unwrap();
        assert_eq!(queue.in_flight(TOPIC), 0);
        assert_eq!(queue.acked(TOPIC), 1);
    }

    #[tokio::test]
    async fn test_nack_redelivers_first() {
        let queue = MemoryQueue::new();
        let subscription = queue.subscribe(TOPIC, Duration::from_millis(100));
        queue.push(TOPIC, Bytes::from_static(b"one"));
        queue.push(TOPIC, Bytes::from_static(b"two"));

        let first = subscription.pull().await.unwrap().unwrap();
        first.delivery.nack().unwrap();

        let again = subscription.pull().await.unwrap().unwrap();
        assert_eq!(again.payload, Bytes::from_static(b"one"));
    }

    #[tokio::test]
    async fn test_crash_redelivers_unacked() {
        let queue = MemoryQueue::new();
        let subscription = queue.subscribe(TOPIC, Duration::from_millis(100));
        queue.push(TOPIC, Bytes::from_static(b"one"));
        queue.push(TOPIC, Bytes::from_static(b"two"));

        let first = subscription.pull().await.unwrap().unwrap();
        let second = subscription.pull().await.unwrap().unwrap();
        second.delivery.ack().unwrap();

        assert_eq!(queue.redeliver_unacked(TOPIC), 1);
        // the dead consumer cannot settle anymore
        assert!(first.delivery.ack().is_err());

        let replayed = subscription.pull().await.unwrap().unwrap();
        assert_eq!(replayed.payload, Bytes::from_static(b"one"));
    }

    #[tokio::test]
    async fn test_pull_wakes_on_publish() {
        let queue = MemoryQueue::new();
        let subscription = queue.subscribe(TOPIC, Duration::from_secs(5));

        let publisher = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.push(TOPIC, Bytes::from_static(b"late"));
        });

        let message = subscription.pull().await.unwrap().expect("no message");
        assert_eq!(message.payload, Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn test_outage_and_close() {
        let queue = MemoryQueue::new();
        let subscription = queue.subscribe(TOPIC, Duration::from_millis(20));

        queue.set_unavailable(TOPIC, true);
        assert!(matches!(
            subscription.pull().await,
            Err(QueueError::Unavailable(_))
        ));
        assert!(queue
            .publish(TOPIC, None, Bytes::from_static(b"x"))
            .await
            .is_err());

        queue.set_unavailable(TOPIC, false);
        subscription.close().await.unwrap();
        assert_eq!(subscription.pull().await.unwrap_err(), QueueError::Closed);
    }
}
