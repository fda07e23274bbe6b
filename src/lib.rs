// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Asynchronous news indexing pipeline: records published after a write are
//! consumed from a durable RabbitMQ queue and applied to the search index, with
//! bounded delayed retries and automatic broker reconnection.

mod consumer;
mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod indexer;
pub mod lapin_broker;
pub mod logging;
pub mod memory;
pub mod opensearch;
pub mod publisher;
pub mod queue;
pub mod record;
pub mod retry;
pub mod scheduler;
