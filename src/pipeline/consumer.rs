//! Partition workers: read, route, then commit or release.
//!
//! One worker per inbound partition, so messages on a partition are handled
//! strictly one at a time in publish order. A message whose processing hit
//! an infrastructure failure is released and retried after a backoff, and
//! nothing behind it on that partition is read until it settles.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, error, error_span, info, warn};

use crate::bus::MessageBus;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::pipeline::router::{MessageRouter, ProcessingOutcome};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    /// Sleep between reads of an empty partition.
    pub poll_interval: Duration,
    /// Pause before re-reading a released message.
    pub retry_backoff: Duration,
}

impl From<&PipelineConfig> for ConsumerConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            topic: config.inbound_topic.clone(),
            poll_interval: config.poll_interval,
            retry_backoff: config.retry_backoff,
        }
    }
}

#[derive(Clone)]
pub struct Consumer {
    bus: Arc<dyn MessageBus>,
    router: Arc<MessageRouter>,
    config: ConsumerConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Consumer {
    pub fn new(bus: Arc<dyn MessageBus>, router: Arc<MessageRouter>, config: ConsumerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bus,
            router,
            config,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Ask every worker to stop after the message it is on.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run one worker per partition until shutdown.
    pub async fn run(&self) -> Result<()> {
        self.bus.ensure_topic(&self.config.topic).await?;

        let mut workers = JoinSet::new();
        for partition in 0..self.bus.partitions() {
            let worker = self.clone();
            workers.spawn(async move { worker.run_partition(partition).await });
        }
        info!(
            topic = %self.config.topic,
            partitions = self.bus.partitions(),
            "consumer started"
        );

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "partition worker panicked");
            }
        }
        info!("consumer stopped");
        Ok(())
    }

    async fn run_partition(&self, partition: u32) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                return;
            }

            let pause = match self.process_once(partition).await {
                Ok(Some(_)) => continue,
                Ok(None) => self.config.poll_interval,
                Err(e) => {
                    warn!(partition, error = %e, "backing off before redelivery");
                    self.config.retry_backoff
                }
            };

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Read and settle at most one message from `partition`.
    ///
    /// Returns `Ok(None)` when the partition is empty. On `Err` the message
    /// has been released for redelivery.
    pub async fn process_once(&self, partition: u32) -> Result<Option<ProcessingOutcome>> {
        let Some(message) = self.bus.consume(&self.config.topic, partition).await? else {
            return Ok(None);
        };

        let span = error_span!(
            "task.consume",
            topic = %message.topic,
            partition,
            msg_id = message.id,
            delivery = message.delivery_count,
        );

        let settled = async {
            let outcome = self.router.route(&message.headers, &message.body).await?;
            self.bus.commit(&message).await?;
            Ok::<_, Error>(outcome)
        }
        .instrument(span)
        .await;

        match settled {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                if let Err(release_error) = self.bus.release(&message).await {
                    warn!(
                        partition,
                        msg_id = message.id,
                        error = %release_error,
                        "release failed; message returns after its visibility timeout"
                    );
                }
                metrics::queue_operations().add(
                    1,
                    &[
                        KeyValue::new("queue", self.config.topic.clone()),
                        KeyValue::new("operation", "redeliver"),
                    ],
                );
                Err(e)
            }
        }
    }
}
