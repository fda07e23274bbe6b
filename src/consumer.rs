// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Indexing Message Consumer
//!
//! This module handles a single delivery from the indexing queue: decode the
//! record, write it to the search index and settle the delivery. Failures go
//! through the retry policy, which either schedules a delayed republish with a
//! bumped `x-retry-count` or gives up and moves the message to the dead-letter
//! queue. The delivery span is parented on the trace context the publisher
//! injected.

use crate::{
    broker::Delivery,
    errors::{AmqpError, IndexError},
    indexer::SearchIndex,
    otel,
    publisher::NewsPublisher,
    record::QueuedRecord,
    retry::{DeliveryOutcome, RetryDecision, RetryPolicy},
    scheduler::Scheduler,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tracing::{debug, error, info, warn};

/// Processes one delivery and settles it on the broker.
///
/// # Parameters
/// * `tracer` - OpenTelemetry tracer for the delivery span
/// * `delivery` - The delivery to process
/// * `index` - Search index the record is written to
/// * `publisher` - Used for delayed republishes and dead-lettering
/// * `policy` - Retry limits and backoff
/// * `retries` - Scheduler running the delayed republishes
///
/// # Returns
/// How the delivery ended, or an error when it could not be settled
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    index: &dyn SearchIndex,
    publisher: &NewsPublisher,
    policy: &RetryPolicy,
    retries: &Scheduler,
) -> Result<DeliveryOutcome, AmqpError> {
    let (_ctx, mut span) = otel::new_span(&delivery.headers, tracer, publisher.queue_name());

    let previous_attempts = delivery.headers.attempts();
    debug!(
        delivery_tag = delivery.delivery_tag,
        attempts = previous_attempts,
        "received message"
    );

    let failure = match apply(delivery, index).await {
        Ok(id) => match delivery.ack().await {
            Ok(()) => {
                info!(id = id, "record indexed");
                span.set_status(Status::Ok);
                return Ok(DeliveryOutcome::Acked);
            }
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                return Err(AmqpError::AckMessageError);
            }
        },
        Err(err) => err,
    };

    span.record_error(&failure);

    match policy.decide(previous_attempts) {
        RetryDecision::Retry { attempt, delay } => {
            if let Err(err) = delivery.nack(false).await {
                // The unsettled message returns to the queue when the channel
                // dies, so no republish is scheduled.
                error!(error = err.to_string(), "error whiling nack msg");
                span.set_status(Status::Error {
                    description: Cow::from("error to nack msg"),
                });
                return Err(AmqpError::NackMessageError);
            }

            warn!(
                error = failure.to_string(),
                attempt = attempt,
                delay_secs = delay.as_secs_f64(),
                "indexing failed, retry scheduled"
            );

            let publisher = publisher.clone();
            let payload = delivery.data.clone();
            let scheduled = retries.schedule(delay, async move {
                match publisher.republish(&payload, attempt).await {
                    Ok(()) => debug!(attempt = attempt, "message republished for retry"),
                    Err(err) => error!(
                        error = err.to_string(),
                        attempt = attempt,
                        "error republishing msg, message lost"
                    ),
                }
            });
            if !scheduled {
                error!(attempt = attempt, "retry scheduler closed, message lost");
            }

            span.set_status(Status::Error {
                description: Cow::from("retry scheduled"),
            });
            Ok(DeliveryOutcome::RetryScheduled { attempt, delay })
        }

        RetryDecision::GiveUp { attempts } => {
            error!(
                error = failure.to_string(),
                attempts = attempts,
                "too many attempts, dropping message"
            );

            match publisher.dead_letter(&delivery.data, attempts).await {
                Ok(true) => debug!("message sent to dlq"),
                Ok(false) => {}
                Err(err) => {
                    error!(error = err.to_string(), "error whiling sending to dlq");
                    span.record_error(&err);
                }
            }

            if let Err(err) = delivery.ack().await {
                error!(error = err.to_string(), "error whiling ack dropped msg");
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                return Err(AmqpError::AckMessageError);
            }

            span.set_status(Status::Error {
                description: Cow::from("dropped after max retries"),
            });
            Ok(DeliveryOutcome::DroppedAfterMaxRetries { attempts })
        }
    }
}

/// Decodes the delivery and writes it to the index, returning the record id.
async fn apply(delivery: &Delivery, index: &dyn SearchIndex) -> Result<i64, IndexError> {
    let record = QueuedRecord::from_slice(&delivery.data)?;
    index.index_document(&record).await?;
    Ok(record.id)
}
