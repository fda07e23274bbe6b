// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Indexing Worker
//!
//! This module runs the consumer side of the pipeline. The worker subscribes to
//! the indexing queue through the `ConnectionManager`, limits itself to
//! `prefetch` unacknowledged deliveries and handles them one at a time, so a
//! message is only taken once the previous one has been acked or nacked.
//!
//! A subscription lost with its channel or connection is re-established through
//! the same retry loop used at startup. Only a consumer cancelled by the broker
//! while its channel stays open ends `run`. Shutdown flushes the pending
//! retries and closes the connection so unacknowledged messages return to the
//! queue.

use crate::{
    broker::{BrokerChannel, DeliveryStream},
    channel::ConnectionManager,
    consumer::consume,
    errors::AmqpError,
    indexer::SearchIndex,
    publisher::NewsPublisher,
    retry::{DeliveryOutcome, RetryPolicy},
    scheduler::Scheduler,
};
use futures_util::StreamExt;
use opentelemetry::{global, global::BoxedTracer};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default number of unacknowledged deliveries held by the worker.
pub const DEFAULT_PREFETCH: u16 = 1;

/// How a `run` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The shutdown signal was received.
    Shutdown,
    /// The broker ended the subscription.
    ConsumerCancelled,
}

/// Why a subscription stopped yielding deliveries.
enum StreamEnd {
    Shutdown,
    Closed,
}

/// Consumes the indexing queue and applies each record to the search index.
pub struct IndexingWorker {
    manager: ConnectionManager,
    publisher: NewsPublisher,
    index: Arc<dyn SearchIndex>,
    policy: RetryPolicy,
    prefetch: u16,
    retries: Scheduler,
    consumer_tag: String,
}

impl IndexingWorker {
    /// # Parameters
    /// * `manager` - Connection manager shared with the publisher
    /// * `index` - Search index records are written to
    /// * `policy` - Retry limits and backoff for failed deliveries
    /// * `prefetch` - Maximum unacknowledged deliveries; 1 keeps processing sequential
    pub fn new(
        manager: ConnectionManager,
        index: Arc<dyn SearchIndex>,
        policy: RetryPolicy,
        prefetch: u16,
    ) -> Self {
        IndexingWorker {
            publisher: NewsPublisher::new(manager.clone()),
            manager,
            index,
            policy,
            prefetch,
            retries: Scheduler::new(),
            consumer_tag: format!("indexing-worker-{}", Uuid::new_v4()),
        }
    }

    pub fn publisher(&self) -> &NewsPublisher {
        &self.publisher
    }

    /// Retries waiting for their backoff to elapse.
    pub fn pending_retries(&self) -> usize {
        self.retries.pending()
    }

    /// Consumes until `shutdown` turns true or the broker cancels the
    /// subscription.
    ///
    /// Subscribing is retried every reconnect delay while the broker is
    /// unreachable, both at startup and after the connection is lost.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerExit {
        let tracer = global::tracer("amqp consumer");

        loop {
            let Some((channel, mut deliveries)) = self.subscribe(&mut shutdown).await else {
                return WorkerExit::Shutdown;
            };

            info!(
                queue = self.publisher.queue_name(),
                prefetch = self.prefetch,
                "worker started, waiting for messages"
            );

            if let StreamEnd::Shutdown = self
                .drain(&tracer, &mut deliveries, &mut shutdown)
                .await
            {
                return WorkerExit::Shutdown;
            }

            if channel.is_open() {
                warn!("consumer cancelled by broker");
                return WorkerExit::ConsumerCancelled;
            }
            warn!("subscription lost with the broker connection, resubscribing");
        }
    }

    async fn drain(
        &self,
        tracer: &BoxedTracer,
        deliveries: &mut DeliveryStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    info!("shutdown requested, no longer taking deliveries");
                    return StreamEnd::Shutdown;
                }

                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    error!(error = err.to_string(), "errors consume msg");
                    continue;
                }
                None => return StreamEnd::Closed,
            };

            // An abandoned delivery stays unacked and goes back to the queue
            // when the channel is closed.
            let result = tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    info!("shutdown requested, abandoning in-flight delivery");
                    return StreamEnd::Shutdown;
                }

                result = consume(
                    tracer,
                    &delivery,
                    self.index.as_ref(),
                    &self.publisher,
                    &self.policy,
                    &self.retries,
                ) => result,
            };

            match result {
                Ok(DeliveryOutcome::Acked) => {}
                Ok(outcome) => debug!(outcome = ?outcome, "delivery settled"),
                Err(err) => error!(error = err.to_string(), "error consume msg"),
            }
        }
    }

    /// Flushes pending retries and closes the broker connection.
    pub async fn shutdown(&self) {
        self.retries.flush().await;
        self.retries.close();
        self.manager.close().await;
        info!("worker stopped");
    }

    async fn subscribe(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<(Arc<dyn BrokerChannel>, DeliveryStream)> {
        loop {
            if *shutdown.borrow() {
                return None;
            }

            match self.try_subscribe().await {
                Ok(subscription) => return Some(subscription),
                Err(AmqpError::ManagerClosed) => return None,
                Err(err) => {
                    let delay = self.manager.reconnect_delay();
                    error!(
                        error = err.to_string(),
                        delay_secs = delay.as_secs_f64(),
                        "error to create the consumer, retrying"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return None,
                    }
                }
            }
        }
    }

    async fn try_subscribe(
        &self,
    ) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), AmqpError> {
        let channel = self.manager.acquire_channel().await?;
        channel.set_prefetch(self.prefetch).await?;
        let deliveries = channel
            .consume(self.publisher.queue_name(), &self.consumer_tag)
            .await?;
        Ok((channel, deliveries))
    }
}
