//! Queue gateway between the backfill and the worker.
//!
//! Production uses a NATS JetStream stream with a durable pull consumer.
//! [`MemoryQueue`] implements the same traits in-process for tests and dry
//! runs.
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream::{Config as StreamConfig, StorageType},
    AckKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Broker;
use crate::model::WorkItem;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),
    #[error("failed to declare topology: {0}")]
    Declare(String),
    #[error("failed to encode work item: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("consume failed: {0}")]
    Consume(String),
    #[error("failed to settle message: {0}")]
    Settle(String),
    #[error("failed to close broker connection: {0}")]
    Close(String),
}

/// How a rejected message should be treated by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Remove permanently; the payload is never redelivered.
    Drop,
    /// Redeliver as soon as possible.
    Requeue,
    /// Redeliver after the given delay.
    RequeueAfter(Duration),
}

/// Names of the stream, subject and durable consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub stream: String,
    pub subject: String,
    pub consumer: String,
    pub max_deliver: i64,
}

impl From<&Broker> for QueueTopology {
    fn from(b: &Broker) -> Self {
        Self {
            stream: b.stream.clone(),
            subject: b.subject.clone(),
            consumer: b.consumer.clone(),
            max_deliver: b.max_deliver,
        }
    }
}

pub fn encode(item: &WorkItem) -> Result<Bytes, QueueError> {
    Ok(Bytes::from(serde_json::to_vec(item)?))
}

pub fn decode(payload: &[u8]) -> Result<WorkItem, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, item: &WorkItem) -> Result<(), QueueError>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    /// Live stream of inbound messages.
    async fn deliveries(
        &self,
    ) -> Result<BoxStream<'static, Result<Delivery, QueueError>>, QueueError>;
}

/// Completion actions for one inbound message.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;
    async fn reject(&self, rejection: Rejection) -> Result<(), QueueError>;
}

/// An inbound message: its payload plus the handle used to settle it.
pub struct Delivery {
    payload: Bytes,
    handle: Box<dyn AckHandle>,
}

impl Delivery {
    pub fn new(payload: Bytes, handle: Box<dyn AckHandle>) -> Self {
        Self { payload, handle }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Permanently remove the message from the queue.
    pub async fn ack(self) -> Result<(), QueueError> {
        self.handle.ack().await
    }

    pub async fn reject(self, rejection: Rejection) -> Result<(), QueueError> {
        self.handle.reject(rejection).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

pub struct JetStreamQueue {
    client: async_nats::Client,
    context: jetstream::Context,
    topology: QueueTopology,
}

impl JetStreamQueue {
    pub async fn connect(url: &str, topology: QueueTopology) -> Result<Self, QueueError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;
        let context = jetstream::new(client.clone());
        info!(url, stream = %topology.stream, "connected to NATS");
        Ok(Self {
            client,
            context,
            topology,
        })
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Create the stream and durable consumer if missing. Repeated calls with
    /// the same topology are no-ops.
    pub async fn declare(&self) -> Result<(), QueueError> {
        self.pull_consumer().await?;
        info!(
            stream = %self.topology.stream,
            subject = %self.topology.subject,
            consumer = %self.topology.consumer,
            "queue topology declared"
        );
        Ok(())
    }

    async fn pull_consumer(&self) -> Result<PullConsumer, QueueError> {
        let t = &self.topology;
        let stream = self
            .context
            .get_or_create_stream(StreamConfig {
                name: t.stream.clone(),
                subjects: vec![t.subject.clone()],
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Declare(e.to_string()))?;
        stream
            .get_or_create_consumer(
                &t.consumer,
                pull::Config {
                    durable_name: Some(t.consumer.clone()),
                    filter_subject: t.subject.clone(),
                    ack_policy: AckPolicy::Explicit,
                    max_deliver: t.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Declare(e.to_string()))
    }

    /// Flush pending publishes before the client is dropped.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.client
            .flush()
            .await
            .map_err(|e| QueueError::Close(e.to_string()))
    }
}

#[async_trait]
impl Publisher for JetStreamQueue {
    async fn publish(&self, item: &WorkItem) -> Result<(), QueueError> {
        let payload = encode(item)?;
        let ack = self
            .context
            .publish(self.topology.subject.clone(), payload)
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?;
        // Wait for the stream to persist the message.
        let ack = ack.await.map_err(|e| QueueError::Publish(e.to_string()))?;
        debug!(post_id = %item.post_id, sequence = ack.sequence, "published work item");
        Ok(())
    }
}

#[async_trait]
impl Consumer for JetStreamQueue {
    async fn deliveries(
        &self,
    ) -> Result<BoxStream<'static, Result<Delivery, QueueError>>, QueueError> {
        let consumer = self.pull_consumer().await?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| QueueError::Consume(e.to_string()))?;
        Ok(messages
            .map(|res| match res {
                Ok(msg) => {
                    let payload = msg.message.payload.clone();
                    Ok(Delivery::new(payload, Box::new(msg)))
                }
                Err(e) => Err(QueueError::Consume(e.to_string())),
            })
            .boxed())
    }
}

#[async_trait]
impl AckHandle for jetstream::Message {
    async fn ack(&self) -> Result<(), QueueError> {
        jetstream::Message::ack(self)
            .await
            .map_err(|e| QueueError::Settle(e.to_string()))
    }

    async fn reject(&self, rejection: Rejection) -> Result<(), QueueError> {
        let kind = match rejection {
            Rejection::Drop => AckKind::Term,
            Rejection::Requeue => AckKind::Nak(None),
            Rejection::RequeueAfter(delay) => AckKind::Nak(Some(delay)),
        };
        self.ack_with(kind)
            .await
            .map_err(|e| QueueError::Settle(e.to_string()))
    }
}

#[derive(Default)]
struct MemoryState {
    pending: VecDeque<Bytes>,
    acked: Vec<Bytes>,
    rejected: Vec<(Bytes, Rejection)>,
    declarations: usize,
}

/// In-process queue. `deliveries()` yields the messages pending at the time
/// of the call; requeued messages go back to the head and are picked up by
/// the next call.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn declare(&self) {
        self.lock().declarations += 1;
    }

    pub fn declarations(&self) -> usize {
        self.lock().declarations
    }

    /// Enqueue an arbitrary payload, bypassing encoding.
    pub fn push_raw(&self, payload: impl Into<Bytes>) {
        self.lock().pending.push_back(payload.into());
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Pending messages decoded as work items; undecodable payloads are skipped.
    pub fn pending_items(&self) -> Vec<WorkItem> {
        self.lock()
            .pending
            .iter()
            .filter_map(|p| decode(p).ok())
            .collect()
    }

    pub fn acked(&self) -> Vec<Bytes> {
        self.lock().acked.clone()
    }

    pub fn rejected(&self) -> Vec<(Bytes, Rejection)> {
        self.lock().rejected.clone()
    }
}

#[async_trait]
impl Publisher for MemoryQueue {
    async fn publish(&self, item: &WorkItem) -> Result<(), QueueError> {
        let payload = encode(item)?;
        self.lock().pending.push_back(payload);
        Ok(())
    }
}

#[async_trait]
impl Consumer for MemoryQueue {
    async fn deliveries(
        &self,
    ) -> Result<BoxStream<'static, Result<Delivery, QueueError>>, QueueError> {
        let drained: Vec<Bytes> = self.lock().pending.drain(..).collect();
        let state = self.state.clone();
        let deliveries = drained.into_iter().map(move |payload| {
            let handle = MemoryAck {
                payload: payload.clone(),
                state: state.clone(),
            };
            Ok(Delivery::new(payload, Box::new(handle)))
        });
        Ok(stream::iter(deliveries).boxed())
    }
}

struct MemoryAck {
    payload: Bytes,
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.acked.push(self.payload.clone());
        Ok(())
    }

    async fn reject(&self, rejection: Rejection) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.rejected.push((self.payload.clone(), rejection));
        if rejection != Rejection::Drop {
            state.pending.push_front(self.payload.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> WorkItem {
        WorkItem {
            post_id: id.into(),
            url: format!("https://www.reddit.com/r/fragranceswap/comments/{id}/"),
            title: "[WTS] lot".into(),
            body: "body".into(),
            seller_username: "seller".into(),
        }
    }

    #[test]
    fn payload_uses_wire_field_names() {
        let payload = encode(&item("abc123")).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["post_id"], "abc123");
        assert_eq!(value["seller_username"], "seller");
        assert_eq!(decode(&payload).unwrap(), item("abc123"));
    }

    #[test]
    fn topology_from_broker_config() {
        let broker = Broker {
            url: "nats://localhost:4222".into(),
            stream: "POSTS".into(),
            subject: "posts.new".into(),
            consumer: "post-worker".into(),
            max_deliver: 7,
        };
        let t = QueueTopology::from(&broker);
        assert_eq!(t.subject, "posts.new");
        assert_eq!(t.max_deliver, 7);
    }

    #[tokio::test]
    async fn memory_queue_publish_then_consume() {
        let q = MemoryQueue::new();
        q.declare();
        q.declare();
        assert_eq!(q.declarations(), 2);

        q.publish(&item("a")).await.unwrap();
        q.publish(&item("b")).await.unwrap();
        assert_eq!(q.pending_items().len(), 2);

        let mut deliveries = q.deliveries().await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(decode(first.payload()).unwrap().post_id, "a");
        first.ack().await.unwrap();

        let second = deliveries.next().await.unwrap().unwrap();
        second.reject(Rejection::Requeue).await.unwrap();
        assert!(deliveries.next().await.is_none());

        assert_eq!(q.acked().len(), 1);
        assert_eq!(q.rejected().len(), 1);
        assert_eq!(q.pending_items(), vec![item("b")]);
    }

    #[tokio::test]
    async fn memory_queue_drop_is_permanent() {
        let q = MemoryQueue::new();
        q.push_raw("not json");
        let mut deliveries = q.deliveries().await.unwrap();
        let d = deliveries.next().await.unwrap().unwrap();
        d.reject(Rejection::Drop).await.unwrap();
        assert_eq!(q.pending_len(), 0);
        assert_eq!(q.rejected()[0].1, Rejection::Drop);
    }

    #[tokio::test]
    async fn requeued_message_returns_to_head() {
        let q = MemoryQueue::new();
        q.publish(&item("first")).await.unwrap();
        let mut deliveries = q.deliveries().await.unwrap();
        q.publish(&item("later")).await.unwrap();
        let d = deliveries.next().await.unwrap().unwrap();
        d.reject(Rejection::RequeueAfter(Duration::from_secs(5)))
            .await
            .unwrap();
        let ids: Vec<String> = q.pending_items().into_iter().map(|i| i.post_id).collect();
        assert_eq!(ids, vec!["first", "later"]);
    }

    #[test]
    fn close_failures_are_not_reported_as_publish_errors() {
        let err = QueueError::Close("connection closed".into());
        assert_eq!(
            err.to_string(),
            "failed to close broker connection: connection closed"
        );
        assert!(!matches!(err, QueueError::Publish(_)));
    }
}
