//! Message handler contract between the broker consumer and the pipeline

use crate::consumer::batch::CommitHandle;
use crate::consumer::error::ConsumerResult;
use async_trait::async_trait;
use bytes::Bytes;

/// A broker message detached from the client, safe to hold across retries.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Topic the message was consumed from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Broker-assigned position within the partition
    pub offset: i64,
    /// Raw payload, absent for tombstones
    pub payload: Option<Bytes>,
}

impl InboundMessage {
    /// Builds a detached message.
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: Option<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload: payload.map(Bytes::from),
        }
    }

    /// Raw payload bytes, if any.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Identity of this message's logical retry chain.
    pub fn correlation_id(&self) -> String {
        format!("{}-{}-{}", self.topic, self.partition, self.offset)
    }
}

/// Processing contract the consumer invokes once per delivered message
/// (and again per retry attempt).
///
/// Implementations must call [`CommitHandle::commit`] if and only if
/// processing succeeded; leaving it out keeps the offset uncommitted.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Processes one raw message.
    async fn handle(&self, message: &InboundMessage, commit: &CommitHandle) -> ConsumerResult<()>;
}
