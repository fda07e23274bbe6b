// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # News Record Publisher
//!
//! This module provides the enqueue side of the pipeline. The write path calls
//! `publish` after its own commit; a failure is reported back but the record is
//! already stored, so callers log it and move on. Restoring the connection is the
//! `ConnectionManager`'s job.

use crate::{
    broker::MessageHeaders, channel::ConnectionManager, errors::AmqpError, otel,
    record::QueuedRecord,
};
use opentelemetry::Context;
use tracing::{debug, error};

/// Publishes news records to the indexing queue as persistent JSON messages.
#[derive(Clone)]
pub struct NewsPublisher {
    manager: ConnectionManager,
}

impl NewsPublisher {
    /// # Parameters
    /// * `manager` - Connection manager owning the shared channel
    pub fn new(manager: ConnectionManager) -> NewsPublisher {
        NewsPublisher { manager }
    }

    pub fn queue_name(&self) -> &str {
        self.manager.queue().name()
    }

    /// Serializes `record` and publishes it for indexing.
    pub async fn publish(&self, record: &QueuedRecord) -> Result<(), AmqpError> {
        let payload = record.to_vec().map_err(|err| {
            error!(error = err.to_string(), id = record.id, "error serializing record");
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        self.publish_json(&payload).await?;
        debug!(id = record.id, "message published to queue");
        Ok(())
    }

    /// Publishes an already serialized record as a first delivery.
    pub async fn publish_json(&self, payload: &[u8]) -> Result<(), AmqpError> {
        self.send(self.queue_name(), payload, MessageHeaders::default())
            .await
    }

    /// Publishes `payload` again for redelivery number `attempt`.
    pub async fn republish(&self, payload: &[u8], attempt: i64) -> Result<(), AmqpError> {
        self.send(
            self.queue_name(),
            payload,
            MessageHeaders::with_retry_count(attempt),
        )
        .await
    }

    /// Copies `payload` to the dead-letter queue, if one is configured.
    ///
    /// Returns `Ok(false)` when there is no dead-letter queue.
    pub async fn dead_letter(&self, payload: &[u8], attempts: i64) -> Result<bool, AmqpError> {
        let Some(dlq) = self.manager.queue().dlq_name() else {
            return Ok(false);
        };

        self.send(dlq, payload, MessageHeaders::with_retry_count(attempts))
            .await
            .map_err(|_| AmqpError::PublishingToDQLError)?;
        Ok(true)
    }

    async fn send(
        &self,
        queue: &str,
        payload: &[u8],
        mut headers: MessageHeaders,
    ) -> Result<(), AmqpError> {
        otel::inject(&Context::current(), &mut headers);

        let channel = self.manager.acquire_channel().await.map_err(|err| {
            error!(error = err.to_string(), "no channel available for publishing");
            err
        })?;

        channel.publish(queue, payload, &headers).await
    }
}
