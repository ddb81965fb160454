//! The task event pipeline: consumer → router → service → store and
//! downstream publisher.

pub mod consumer;
pub mod publisher;
pub mod router;
pub mod service;

use std::sync::Arc;

use crate::bus::MessageBus;
use crate::config::PipelineConfig;
use crate::store::TaskStore;
use crate::telemetry::propagation::{TracingAdapter, W3cPropagator};

pub use consumer::{Consumer, ConsumerConfig};
pub use publisher::{DownstreamPublisher, PublishResult};
pub use router::{MessageRouter, ProcessingOutcome};
pub use service::TaskService;

/// Wire a consumer over `store` and `bus` using W3C trace propagation.
pub fn build(
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn MessageBus>,
    config: &PipelineConfig,
) -> Consumer {
    build_with_tracer(store, bus, Arc::new(W3cPropagator), config)
}

pub fn build_with_tracer(
    store: Arc<dyn TaskStore>,
    bus: Arc<dyn MessageBus>,
    tracer: Arc<dyn TracingAdapter>,
    config: &PipelineConfig,
) -> Consumer {
    let publisher = DownstreamPublisher::new(
        Arc::clone(&bus),
        Arc::clone(&tracer),
        config.outbound_topic.clone(),
        config.source.clone(),
        config.publish_timeout,
    );
    let service = TaskService::new(store, publisher, config.store_timeout);
    let router = MessageRouter::new(service, tracer);
    Consumer::new(bus, Arc::new(router), ConsumerConfig::from(config))
}
