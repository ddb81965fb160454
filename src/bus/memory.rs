//! In-process message bus with the same delivery contract as pgmq:
//! per-partition ordering, at-least-once delivery, and released messages
//! going back to the head of their partition.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::bus::{BusMessage, MessageBus, OutboundMessage, partition_for};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Partition {
    next_id: i64,
    ready: BTreeMap<i64, BusMessage>,
    in_flight: BTreeMap<i64, BusMessage>,
    committed: Vec<BusMessage>,
}

#[derive(Debug, Clone)]
pub struct InMemoryBus {
    partitions: u32,
    state: Arc<Mutex<HashMap<(String, u32), Partition>>>,
    unavailable: Arc<AtomicBool>,
    reject_produce: Arc<AtomicBool>,
    produce_latency_ms: Arc<AtomicU64>,
}

impl InMemoryBus {
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Arc::default(),
            unavailable: Arc::default(),
            reject_produce: Arc::default(),
            produce_latency_ms: Arc::default(),
        }
    }

    /// Fail every operation, as if the broker were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail only `produce`; consuming and committing keep working.
    pub fn set_reject_produce(&self, reject: bool) {
        self.reject_produce.store(reject, Ordering::SeqCst);
    }

    /// Delay every `produce` by `latency`.
    pub fn set_produce_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.produce_latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Messages on `topic` that are waiting to be consumed, in partition
    /// then id order.
    pub fn pending(&self, topic: &str) -> Vec<BusMessage> {
        self.collect(topic, |p| p.ready.values().cloned().collect())
    }

    /// Messages on `topic` that have been committed, in commit order per
    /// partition.
    pub fn committed(&self, topic: &str) -> Vec<BusMessage> {
        self.collect(topic, |p| p.committed.clone())
    }

    pub fn in_flight(&self, topic: &str) -> usize {
        self.collect(topic, |p| p.in_flight.values().cloned().collect())
            .len()
    }

    fn collect(&self, topic: &str, pick: impl Fn(&Partition) -> Vec<BusMessage>) -> Vec<BusMessage> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        (0..self.partitions)
            .filter_map(|n| state.get(&(topic.to_string(), n)))
            .flat_map(pick)
            .collect()
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Bus("broker unavailable".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<(String, u32), Partition>>> {
        self.state
            .lock()
            .map_err(|e| Error::Other(format!("bus state lock poisoned: {e}")))
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    async fn ensure_topic(&self, topic: &str) -> Result<()> {
        self.check()?;
        let mut state = self.lock()?;
        for n in 0..self.partitions {
            state.entry((topic.to_string(), n)).or_default();
        }
        Ok(())
    }

    async fn consume(&self, topic: &str, partition: u32) -> Result<Option<BusMessage>> {
        self.check()?;
        let mut state = self.lock()?;
        let Some(p) = state.get_mut(&(topic.to_string(), partition)) else {
            return Ok(None);
        };
        let Some((id, mut message)) = p.ready.pop_first() else {
            return Ok(None);
        };
        message.delivery_count += 1;
        p.in_flight.insert(id, message.clone());
        Ok(Some(message))
    }

    async fn produce(&self, topic: &str, message: OutboundMessage) -> Result<i64> {
        let latency = self.produce_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.check()?;
        if self.reject_produce.load(Ordering::SeqCst) {
            return Err(Error::Bus(format!("produce to {topic} rejected")));
        }

        let partition = partition_for(message.key.as_deref(), self.partitions);
        let mut state = self.lock()?;
        let p = state.entry((topic.to_string(), partition)).or_default();
        p.next_id += 1;
        let id = p.next_id;
        p.ready.insert(
            id,
            BusMessage {
                topic: topic.to_string(),
                partition,
                id,
                key: message.key,
                headers: message.headers,
                body: message.body.into_bytes(),
                delivery_count: 0,
            },
        );
        Ok(id)
    }

    async fn commit(&self, message: &BusMessage) -> Result<()> {
        self.check()?;
        let mut state = self.lock()?;
        let p = state
            .get_mut(&(message.topic.clone(), message.partition))
            .ok_or_else(|| Error::Bus(format!("unknown partition for message {}", message.id)))?;
        let committed = p
            .in_flight
            .remove(&message.id)
            .ok_or_else(|| Error::Bus(format!("message {} is not in flight", message.id)))?;
        p.committed.push(committed);
        Ok(())
    }

    async fn release(&self, message: &BusMessage) -> Result<()> {
        self.check()?;
        let mut state = self.lock()?;
        let p = state
            .get_mut(&(message.topic.clone(), message.partition))
            .ok_or_else(|| Error::Bus(format!("unknown partition for message {}", message.id)))?;
        if let Some(released) = p.in_flight.remove(&message.id) {
            p.ready.insert(released.id, released);
        }
        Ok(())
    }
}
