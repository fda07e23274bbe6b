// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The connection manager, publisher and worker talk to the message broker
//! through these traits. `lapin_broker` implements them over AMQP and `memory`
//! implements them in-process, which is how the pipeline is exercised in tests.

use crate::{errors::AmqpError, queue::QueueDefinition};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};

/// Callback fired once when a connection errors or is closed.
pub type CloseHook = Box<dyn Fn(AmqpError) + Send + Sync>;

/// Stream of deliveries for one subscription. It ends when the broker
/// cancels the consumer or the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Message metadata the pipeline cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    /// Value of `x-retry-count`; absent on first publish.
    pub retry_count: Option<i64>,
    /// OpenTelemetry propagation fields (e.g. `traceparent`).
    pub trace_context: BTreeMap<String, String>,
}

impl MessageHeaders {
    pub fn with_retry_count(retry_count: i64) -> Self {
        MessageHeaders {
            retry_count: Some(retry_count),
            trace_context: BTreeMap::default(),
        }
    }

    /// Number of redeliveries so far, 0 when the header is missing.
    pub fn attempts(&self) -> i64 {
        self.retry_count.unwrap_or_default().max(0)
    }
}

/// Settles a single delivery on the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message handed to a consumer, still owned by the broker until acked or
/// nacked.
pub struct Delivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub headers: MessageHeaders,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        data: Vec<u8>,
        headers: MessageHeaders,
        acker: Box<dyn Acker>,
    ) -> Self {
        Delivery {
            delivery_tag,
            data,
            headers,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("data", &String::from_utf8_lossy(&self.data))
            .field("headers", &self.headers)
            .finish()
    }
}

/// An open channel on a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a queue. Repeating the declaration is harmless.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries held by consumers on
    /// this channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    /// Publishes a persistent message to `queue` through the default exchange.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        headers: &MessageHeaders,
    ) -> Result<(), AmqpError>;

    /// Starts a manual-ack subscription on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// False once the channel or its connection has been closed by either
    /// side. A consumer cancelled by the broker leaves its channel open.
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// An established broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Registers a hook fired when the connection errors or closes.
    fn on_close(&self, hook: CloseHook);

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens connections to a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}
