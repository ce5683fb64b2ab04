//! Per-topic broadcast bus with a bounded polling log

use crate::{BusEvent, EventType, Topic};
use catalog_core::CatalogConfig;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Closed topics whose retained log stays pollable, oldest evicted first.
pub const CLOSED_TOPIC_RETENTION: usize = 256;

/// Sequence counter and retained events of one topic.
#[derive(Debug, Default)]
struct TopicLog {
    last_seq: u64,
    events: VecDeque<BusEvent>,
}

#[derive(Debug)]
struct TopicChannel {
    tx: broadcast::Sender<BusEvent>,
    log: Mutex<TopicLog>,
}

/// Notification bus shared by the supervisor and its subscribers.
///
/// Cloning shares the underlying channels.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    channels: Arc<DashMap<Topic, Arc<TopicChannel>>>,
    closed: Arc<Mutex<VecDeque<(Topic, TopicLog)>>>,
    channel_capacity: usize,
    log_capacity: usize,
}

impl NotificationBus {
    /// Create a bus with the given per-topic broadcast buffer and log size.
    pub fn new(channel_capacity: usize, log_capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            closed: Arc::new(Mutex::new(VecDeque::new())),
            channel_capacity: channel_capacity.max(1),
            log_capacity,
        }
    }

    pub fn from_config(config: &CatalogConfig) -> Self {
        Self::new(config.event_channel_capacity, config.event_log_capacity)
    }

    fn channel(&self, topic: Topic) -> Arc<TopicChannel> {
        self.channels
            .entry(topic)
            .or_insert_with(|| {
                let (tx, _rx) = broadcast::channel(self.channel_capacity);
                Arc::new(TopicChannel {
                    tx,
                    log: Mutex::new(TopicLog::default()),
                })
            })
            .clone()
    }

    /// Publish an event on a topic and return it with its sequence number.
    ///
    /// Sequence assignment and broadcast happen under the topic lock, so
    /// subscribers observe events in sequence order.
    pub fn publish(
        &self,
        topic: Topic,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> BusEvent {
        let channel = self.channel(topic);
        let mut log = channel.log.lock().unwrap_or_else(|e| e.into_inner());
        log.last_seq += 1;
        let event = BusEvent {
            topic,
            seq: log.last_seq,
            event_type,
            payload,
            emitted_at: Utc::now(),
        };

        if self.log_capacity > 0 {
            if log.events.len() >= self.log_capacity {
                log.events.pop_front();
            }
            log.events.push_back(event.clone());
        }

        match channel.tx.send(event.clone()) {
            Ok(receivers) => debug!(
                topic = %topic,
                seq = event.seq,
                event_type = event_type.as_str(),
                receivers,
                "Published event"
            ),
            Err(_) => debug!(
                topic = %topic,
                seq = event.seq,
                event_type = event_type.as_str(),
                "No subscribers for event"
            ),
        }
        event
    }

    /// Publish the same event type and payload on several topics.
    pub fn publish_all(
        &self,
        topics: &[Topic],
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Vec<BusEvent> {
        topics
            .iter()
            .map(|t| self.publish(*t, event_type, payload.clone()))
            .collect()
    }

    /// Publish a `log` event with a message.
    pub fn log(&self, topic: Topic, message: impl Into<String>) -> BusEvent {
        self.publish(
            topic,
            EventType::Log,
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Subscribe to future events of a topic. No history is delivered.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        Subscription {
            topic,
            rx: self.channel(topic).tx.subscribe(),
        }
    }

    /// Retained events of a topic with `seq > after_seq`, oldest first.
    ///
    /// This is the polling fallback over the same event stream; events
    /// older than the retained window are gone.
    pub fn poll(&self, topic: Topic, after_seq: u64) -> Vec<BusEvent> {
        self.with_log(topic, |log| {
            log.events
                .iter()
                .filter(|e| e.seq > after_seq)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    /// Last sequence number published on a topic (0 if none).
    pub fn last_seq(&self, topic: Topic) -> u64 {
        self.with_log(topic, |log| log.last_seq).unwrap_or(0)
    }

    fn with_log<T>(&self, topic: Topic, read: impl FnOnce(&TopicLog) -> T) -> Option<T> {
        if let Some(channel) = self.channels.get(&topic).map(|c| Arc::clone(c.value())) {
            let log = channel.log.lock().unwrap_or_else(|e| e.into_inner());
            return Some(read(&log));
        }
        let closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        closed.iter().rev().find(|(t, _)| *t == topic).map(|(_, log)| read(log))
    }

    /// End a topic. Current subscribers receive what is buffered and then
    /// the end of the stream; the retained log moves to a bounded list of
    /// closed topics so late pollers still see the final events.
    pub fn close(&self, topic: Topic) {
        let Some((_, channel)) = self.channels.remove(&topic) else {
            return;
        };
        let log = std::mem::take(&mut *channel.log.lock().unwrap_or_else(|e| e.into_inner()));
        drop(channel);

        let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        if closed.len() >= CLOSED_TOPIC_RETENTION {
            closed.pop_front();
        }
        closed.push_back((topic, log));
        debug!(topic = %topic, "Closed topic");
    }

    /// Whether a topic currently holds a live channel.
    pub fn is_open(&self, topic: Topic) -> bool {
        self.channels.contains_key(&topic)
    }

    /// Number of live topic channels.
    pub fn open_topics(&self) -> usize {
        self.channels.len()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::from_config(&CatalogConfig::default())
    }
}

/// A subscriber's handle on one topic.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<BusEvent>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next event, or `None` once the topic is closed.
    ///
    /// A subscriber that lagged behind the broadcast buffer skips the
    /// missed events and continues with the oldest one still buffered.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(topic = %self.topic, missed, "Subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(topic = %self.topic, missed, "Subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::Source;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = NotificationBus::new(16, 16);
        let topic = Topic::Operation(Uuid::now_v7());
        let mut sub = bus.subscribe(topic);

        bus.publish(topic, EventType::Start, json!({}));
        for i in 0..5 {
            bus.publish(topic, EventType::Progress, json!({ "i": i }));
        }
        bus.publish(topic, EventType::Complete, json!({}));

        let mut seqs = Vec::new();
        for _ in 0..7 {
            seqs.push(sub.recv().await.unwrap().seq);
        }
        assert_eq!(seqs, (1..=7).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = NotificationBus::new(16, 16);
        let status = Topic::SourceStatus(Source::Storefront);
        let progress = Topic::SourceProgress(Source::Storefront);
        let mut sub = bus.subscribe(status);

        bus.publish(progress, EventType::Progress, json!({}));
        bus.publish(status, EventType::Start, json!({}));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.topic, status);
        assert_eq!(event.seq, 1);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_no_history() {
        let bus = NotificationBus::new(16, 16);
        let topic = Topic::Operation(Uuid::now_v7());
        bus.publish(topic, EventType::Start, json!({}));

        let mut sub = bus.subscribe(topic);
        assert!(sub.try_recv().is_none());
        bus.publish(topic, EventType::Log, json!({}));
        assert_eq!(sub.recv().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_but_keeps_order() {
        let bus = NotificationBus::new(4, 16);
        let topic = Topic::Operation(Uuid::now_v7());
        let mut sub = bus.subscribe(topic);
        for _ in 0..10 {
            bus.publish(topic, EventType::Progress, json!({}));
        }
        let mut last = 0;
        while let Some(event) = sub.try_recv() {
            assert!(event.seq > last);
            last = event.seq;
        }
        assert_eq!(last, 10);
    }

    #[test]
    fn test_poll_after_seq_and_capacity() {
        let bus = NotificationBus::new(8, 3);
        let topic = Topic::Import(Uuid::now_v7());
        for _ in 0..5 {
            bus.publish(topic, EventType::Progress, json!({}));
        }
        let all: Vec<u64> = bus.poll(topic, 0).iter().map(|e| e.seq).collect();
        assert_eq!(all, vec![3, 4, 5]);
        let newer: Vec<u64> = bus.poll(topic, 4).iter().map(|e| e.seq).collect();
        assert_eq!(newer, vec![5]);
        assert_eq!(bus.last_seq(topic), 5);
        assert!(bus.poll(Topic::Import(Uuid::nil()), 0).is_empty());
    }

    #[tokio::test]
    async fn test_close_ends_subscription() {
        let bus = NotificationBus::new(8, 8);
        let topic = Topic::Operation(Uuid::now_v7());
        let mut sub = bus.subscribe(topic);
        bus.publish(topic, EventType::Complete, json!({}));
        bus.close(topic);
        assert_eq!(sub.recv().await.unwrap().event_type, EventType::Complete);
        assert!(sub.recv().await.is_none());
        assert!(!bus.is_open(topic));
        assert_eq!(bus.open_topics(), 0);
    }

    #[test]
    fn test_closed_topic_stays_pollable_within_retention() {
        let bus = NotificationBus::new(8, 8);
        let first = Topic::Import(Uuid::now_v7());
        bus.publish(first, EventType::Start, json!({}));
        bus.publish(first, EventType::Complete, json!({}));
        bus.close(first);

        assert_eq!(bus.last_seq(first), 2);
        assert_eq!(bus.poll(first, 1).len(), 1);

        for _ in 0..CLOSED_TOPIC_RETENTION {
            let topic = Topic::Operation(Uuid::now_v7());
            bus.publish(topic, EventType::Start, json!({}));
            bus.close(topic);
        }
        assert!(bus.poll(first, 0).is_empty());
        assert_eq!(bus.open_topics(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publishers_keep_sequence_order() {
        let bus = NotificationBus::new(1024, 0);
        let topic = Topic::SourceProgress(Source::VendorFeed);
        let mut sub = bus.subscribe(topic);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    bus.publish(topic, EventType::Progress, json!({}));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut expected = 1;
        while let Some(event) = sub.try_recv() {
            assert_eq!(event.seq, expected);
            expected += 1;
        }
        assert_eq!(expected, 201);
    }
}
