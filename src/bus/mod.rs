//! Partitioned message bus.
//!
//! A topic is split into a fixed number of partitions. Keyed messages always
//! land on the same partition, which is what keeps every event for one task
//! in order: producers of `COMPLETED`/`ERROR` events must key them by
//! `task_id`, and downstream crawl requests are keyed the same way.
//!
//! Delivery is at-least-once. A consumed message stays owned by the reader
//! until it is committed (done, never delivered again) or released
//! (delivered again, ahead of anything newer on its partition).

pub mod memory;
pub mod pgmq;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::validation::Headers;

pub use memory::InMemoryBus;
pub use pgmq::PgmqBus;

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub partition: u32,
    /// Position within the partition. Increases with publish order.
    pub id: i64,
    pub key: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// How many times this message has been handed out, this time included.
    pub delivery_count: i32,
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub key: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: String,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Partitions per topic.
    fn partitions(&self) -> u32;

    /// Create the topic's partitions if they do not exist.
    async fn ensure_topic(&self, topic: &str) -> Result<()>;

    /// Take the oldest deliverable message on a partition, if any.
    async fn consume(&self, topic: &str, partition: u32) -> Result<Option<BusMessage>>;

    /// Publish to the partition chosen by the message key. Returns the id
    /// assigned within that partition.
    async fn produce(&self, topic: &str, message: OutboundMessage) -> Result<i64>;

    /// Mark a consumed message as done.
    async fn commit(&self, message: &BusMessage) -> Result<()>;

    /// Hand a consumed message back for redelivery.
    async fn release(&self, message: &BusMessage) -> Result<()>;
}

/// Pick the partition for a key (FNV-1a). Unkeyed messages are spread
/// randomly.
pub fn partition_for(key: Option<&str>, partitions: u32) -> u32 {
    let partitions = partitions.max(1);
    let random;
    let key = match key {
        Some(key) => key,
        None => {
            random = Uuid::new_v4().to_string();
            random.as_str()
        }
    };
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % partitions
}
