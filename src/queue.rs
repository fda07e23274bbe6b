// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definition
//!
//! This module describes the queue the indexing pipeline publishes to and
//! consumes from, together with its optional Dead Letter Queue (DLQ).

/// Name of the indexing queue shared by the write path and the worker.
pub const NEWS_INDEXING_QUEUE: &str = "news_indexing";

/// Header carrying the number of redeliveries a message has been through.
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Declaring the same definition twice is a no-op on the broker, so it is
/// re-declared on every new channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) dlq_name: Option<String>,
}

impl Default for QueueDefinition {
    fn default() -> Self {
        QueueDefinition::new(NEWS_INDEXING_QUEUE).durable()
    }
}

impl QueueDefinition {
    /// Creates a new, non-durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            dlq_name: None,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Adds a Dead Letter Queue named after the main queue with a "-dlq" suffix.
    ///
    /// Messages that run out of retries are copied there before being acked.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    /// The definitions to declare on a fresh channel: the DLQ (same
    /// durability) followed by the main queue.
    pub fn declarations(&self) -> Vec<QueueDefinition> {
        let mut defs = vec![];
        if let Some(dlq) = &self.dlq_name {
            defs.push(QueueDefinition {
                name: dlq.clone(),
                durable: self.durable,
                dlq_name: None,
            });
        }
        defs.push(self.clone());
        defs
    }
}
