//! Message bus on pgmq.
//!
//! Each (topic, partition) is its own pgmq queue, `{topic}_p{n}`. The stored
//! pgmq payload is an envelope `{key, headers, body}`. pgmq reads the lowest
//! visible `msg_id` first, so releasing a message with a zero visibility
//! timeout puts it back at the head of its partition. Committed messages
//! are archived, not deleted, and stay available for audit and replay.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::bus::{BusMessage, MessageBus, OutboundMessage, partition_for};
use crate::db::Db;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct PgmqBus {
    db: Db,
    partitions: u32,
    visibility_timeout: Duration,
}

impl PgmqBus {
    pub fn new(db: Db, partitions: u32, visibility_timeout: Duration) -> Self {
        Self {
            db,
            partitions: partitions.max(1),
            visibility_timeout,
        }
    }

    pub fn queue_name(topic: &str, partition: u32) -> String {
        format!("{topic}_p{partition}")
    }

    fn vt_seconds(&self) -> Result<i32> {
        i32::try_from(self.visibility_timeout.as_secs().max(1))
            .map_err(|_| Error::Config("visibility timeout too large".to_string()))
    }
}

#[async_trait]
impl MessageBus for PgmqBus {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn ensure_topic(&self, topic: &str) -> Result<()> {
        for partition in 0..self.partitions {
            self.db
                .create_queue(&Self::queue_name(topic, partition))
                .await?;
        }
        Ok(())
    }

    async fn consume(&self, topic: &str, partition: u32) -> Result<Option<BusMessage>> {
        let queue = Self::queue_name(topic, partition);
        let Some(msg) = self.db.read_from_queue(&queue, self.vt_seconds()?).await? else {
            return Ok(None);
        };

        // Anything that is not an envelope is handed on with empty headers,
        // so the router rejects it instead of it wedging the partition.
        let envelope = match serde_json::from_value::<OutboundMessage>(msg.message.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue = %queue, msg_id = msg.msg_id, error = %e, "message is not a bus envelope");
                OutboundMessage {
                    key: None,
                    headers: Default::default(),
                    body: msg.message.to_string(),
                }
            }
        };

        Ok(Some(BusMessage {
            topic: topic.to_string(),
            partition,
            id: msg.msg_id,
            key: envelope.key,
            headers: envelope.headers,
            body: envelope.body.into_bytes(),
            delivery_count: msg.read_ct,
        }))
    }

    async fn produce(&self, topic: &str, message: OutboundMessage) -> Result<i64> {
        let partition = partition_for(message.key.as_deref(), self.partitions);
        let payload = serde_json::to_value(&message)?;
        self.db
            .send_to_queue(&Self::queue_name(topic, partition), &payload)
            .await
    }

    async fn commit(&self, message: &BusMessage) -> Result<()> {
        self.db
            .archive_message(&Self::queue_name(&message.topic, message.partition), message.id)
            .await
    }

    async fn release(&self, message: &BusMessage) -> Result<()> {
        self.db
            .set_visibility(
                &Self::queue_name(&message.topic, message.partition),
                message.id,
                0,
            )
            .await
    }
}
