// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker Settings
//!
//! Settings are read from an optional `config/default` file and then from the
//! process environment, which wins. Keys are flat, so `RABBITMQ_URL` maps to
//! `rabbitmq_url`. Call `dotenvy::dotenv()` first to pick up a `.env` file.

use crate::{
    channel::DEFAULT_RECONNECT_DELAY,
    dispatcher::DEFAULT_PREFETCH,
    indexer::NEWS_INDEX,
    queue::{QueueDefinition, NEWS_INDEXING_QUEUE},
    retry::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES},
};
use ::config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app_name: String,
    pub log_level: String,

    pub rabbitmq_url: String,
    pub queue_name: String,
    /// Declare `<queue_name>-dlq` and move exhausted messages there.
    pub dead_letter_queue: bool,
    pub reconnect_delay_secs: u64,
    pub prefetch: u16,

    pub elasticsearch_url: String,
    pub elasticsearch_username: String,
    /// Basic auth is only sent when this is set and non-empty.
    pub elasticsearch_password: Option<String>,
    pub index_name: String,

    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            app_name: "news-indexer-worker".to_owned(),
            log_level: "info".to_owned(),
            rabbitmq_url: "amqp://localhost".to_owned(),
            queue_name: NEWS_INDEXING_QUEUE.to_owned(),
            dead_letter_queue: true,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY.as_secs(),
            prefetch: DEFAULT_PREFETCH,
            elasticsearch_url: "http://localhost:9200".to_owned(),
            elasticsearch_username: "elastic".to_owned(),
            elasticsearch_password: None,
            index_name: NEWS_INDEX.to_owned(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_secs: DEFAULT_BASE_DELAY.as_secs(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Settings, ConfigError> {
        Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn queue(&self) -> QueueDefinition {
        let queue = QueueDefinition::new(&self.queue_name).durable();
        if self.dead_letter_queue {
            queue.with_dlq()
        } else {
            queue
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_secs(self.retry_base_delay_secs),
        )
    }

    pub fn elasticsearch_password(&self) -> Option<&str> {
        self.elasticsearch_password
            .as_deref()
            .filter(|password| !password.is_empty())
    }
}
