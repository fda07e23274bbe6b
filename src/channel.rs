// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module owns the single broker connection and channel shared by the
//! publisher and the worker. The connection is established lazily, the queue is
//! declared on every new channel, and a lost connection is re-established in the
//! background after a fixed delay so the process heals without a restart.
//!
//! Only one connect sequence runs at a time. Callers that arrive while one is in
//! flight wait for it and share its outcome instead of starting their own.

use crate::{
    broker::{Broker, BrokerChannel, BrokerConnection},
    errors::AmqpError,
    queue::QueueDefinition,
    scheduler::Scheduler,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Default wait before reconnecting after a failure or a closed connection.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Default)]
struct ConnectionState {
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    /// Bumped on every established connection; close hooks carry the value
    /// they were registered with.
    generation: u64,
    last_failure: Option<AmqpError>,
}

struct Inner {
    broker: Arc<dyn Broker>,
    queue: QueueDefinition,
    reconnect_delay: Duration,
    state: Mutex<ConnectionState>,
    /// Completed connect sequences, readable without the state lock.
    attempts: AtomicU64,
    reconnect_pending: AtomicBool,
    closed: AtomicBool,
    reconnects: Scheduler,
}

/// Owner of the process-wide broker connection and channel.
///
/// Cloning is cheap; every clone manages the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Creates a manager; no connection is attempted until `connect` or
    /// `acquire_channel` is called.
    ///
    /// # Parameters
    /// * `broker` - Backend used to open connections
    /// * `queue` - Queue declared on every new channel
    /// * `reconnect_delay` - Wait before each background reconnect attempt
    pub fn new(broker: Arc<dyn Broker>, queue: QueueDefinition, reconnect_delay: Duration) -> Self {
        ConnectionManager {
            inner: Arc::new(Inner {
                broker,
                queue,
                reconnect_delay,
                state: Mutex::new(ConnectionState::default()),
                attempts: AtomicU64::new(0),
                reconnect_pending: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                reconnects: Scheduler::new(),
            }),
        }
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.inner.queue
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.inner.reconnect_delay
    }

    /// Eagerly establishes the connection, channel and queue.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.acquire_channel().await.map(|_| ())
    }

    /// Returns the shared channel, connecting first when needed.
    ///
    /// On failure the cached state is cleared, a background reconnect is
    /// scheduled and the error is returned to this caller.
    pub async fn acquire_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ManagerClosed);
        }

        let observed = self.inner.attempts.load(Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;

        if let Some(channel) = &state.channel {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            warn!("cached channel was closed by the broker, opening a new one");
            state.channel = None;
        }

        // A connect sequence finished while we waited for the lock.
        if self.inner.attempts.load(Ordering::SeqCst) != observed {
            if let Some(err) = &state.last_failure {
                debug!("sharing the outcome of the connect attempt in flight");
                return Err(err.clone());
            }
        }

        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ManagerClosed);
        }

        let result = self.establish(&mut state).await;
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(channel) => {
                state.last_failure = None;
                Ok(channel)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    delay_secs = self.inner.reconnect_delay.as_secs_f64(),
                    "failed to connect to broker, retrying later"
                );
                state.connection = None;
                state.channel = None;
                state.last_failure = Some(err.clone());
                drop(state);

                self.schedule_reconnect();
                Err(err)
            }
        }
    }

    async fn establish(
        &self,
        state: &mut MutexGuard<'_, ConnectionState>,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let connection = match state.connection.clone() {
            Some(connection) if connection.is_open() => connection,
            _ => {
                let connection = self.inner.broker.connect().await?;
                state.generation += 1;
                self.register_close_hook(connection.as_ref(), state.generation);
                info!(generation = state.generation, "connected to broker");
                state.connection = Some(connection.clone());
                connection
            }
        };

        let channel = connection.create_channel().await?;
        for def in self.inner.queue.declarations() {
            channel.declare_queue(&def).await?;
        }
        info!(queue = self.inner.queue.name(), "queue ready");

        state.channel = Some(channel.clone());
        Ok(channel)
    }

    fn register_close_hook(&self, connection: &dyn BrokerConnection, generation: u64) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        connection.on_close(Box::new(move |err| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            ConnectionManager { inner }.handle_close(generation, err);
        }));
    }

    fn handle_close(&self, generation: u64, err: AmqpError) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        warn!(
            error = err.to_string(),
            generation = generation,
            delay_secs = self.inner.reconnect_delay.as_secs_f64(),
            "broker connection closed, reconnecting"
        );

        let manager = self.clone();
        self.inner.reconnects.schedule(Duration::ZERO, async move {
            if manager.invalidate(generation).await {
                manager.schedule_reconnect();
            }
        });
    }

    /// Drops the cached connection and channel if they still belong to
    /// `generation`. Returns whether anything was dropped.
    async fn invalidate(&self, generation: u64) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.generation != generation || state.connection.is_none() {
            debug!(generation = generation, "ignoring close of a stale connection");
            return false;
        }

        state.connection = None;
        state.channel = None;
        true
    }

    fn schedule_reconnect(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        // One pending reconnect at a time.
        if self
            .inner
            .reconnect_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let manager = self.clone();
        self.inner
            .reconnects
            .schedule(self.inner.reconnect_delay, async move {
                manager.inner.reconnect_pending.store(false, Ordering::SeqCst);
                debug!("reconnecting to broker");
                if manager.acquire_channel().await.is_ok() {
                    info!("broker connection restored");
                }
            });
    }

    /// Whether an open channel is currently cached.
    pub async fn is_ready(&self) -> bool {
        self.inner
            .state
            .lock()
            .await
            .channel
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    /// Tears the connection down: no more reconnects, then the channel and
    /// the connection are closed so unacknowledged messages go back to the
    /// queue.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.reconnects.close();
        self.inner.reconnects.abort_all();

        let (channel, connection) = {
            let mut state = self.inner.state.lock().await;
            (state.channel.take(), state.connection.take())
        };

        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "error closing channel");
            }
        }
        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                warn!(error = err.to_string(), "error closing connection");
            }
        }

        info!("broker connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::MessageHeaders, memory::InMemoryBroker};

    fn manager(broker: &InMemoryBroker) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(broker.clone()),
            QueueDefinition::default(),
            DEFAULT_RECONNECT_DELAY,
        )
    }

    /// Lets the paused runtime fire due timers and run woken tasks.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_connects_once_and_declares_durable_queue() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        manager.acquire_channel().await.unwrap();
        manager.acquire_channel().await.unwrap();

        assert_eq!(broker.connect_count(), 1);
        assert_eq!(broker.queue_durable("news_indexing"), Some(true));
        assert!(manager.is_ready().await);
    }

    #[tokio::test(start_paused = true)]
    async fn declares_dead_letter_queue_when_configured() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(
            Arc::new(broker.clone()),
            QueueDefinition::default().with_dlq(),
            DEFAULT_RECONNECT_DELAY,
        );

        manager.connect().await.unwrap();

        assert_eq!(broker.queue_durable("news_indexing-dlq"), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_share_one_connect() {
        let broker = InMemoryBroker::new();
        broker.set_connect_delay(Some(Duration::from_secs(1)));
        let manager = manager(&broker);

        let (a, b, c) = tokio::join!(
            manager.acquire_channel(),
            manager.acquire_channel(),
            manager.acquire_channel()
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_share_a_failed_connect() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        broker.set_connect_delay(Some(Duration::from_secs(1)));
        let manager = manager(&broker);

        let (a, b) = tokio::join!(manager.acquire_channel(), manager.acquire_channel());

        assert_eq!(
            a.err(),
            Some(AmqpError::ConnectionError("broker unavailable".to_owned()))
        );
        assert!(b.is_err());
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_retries_in_background() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let manager = manager(&broker);

        assert!(manager.connect().await.is_err());
        broker.set_available(true);

        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert!(!manager.is_ready().await);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(manager.is_ready().await);
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_keep_a_single_reconnect_pending() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let manager = manager(&broker);

        for _ in 0..3 {
            assert!(manager.acquire_channel().await.is_err());
        }
        assert_eq!(manager.inner.reconnects.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_broker_closes_connection() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await.unwrap();

        broker.close_connections();
        settle().await;
        assert!(!manager.is_ready().await);

        tokio::time::advance(DEFAULT_RECONNECT_DELAY).await;
        settle().await;

        assert!(manager.is_ready().await);
        assert_eq!(broker.connect_count(), 2);
        let channel = manager.acquire_channel().await.unwrap();
        channel
            .publish("news_indexing", b"{}", &MessageHeaders::default())
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("news_indexing"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_reconnect_reuses_connection_made_in_between() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await.unwrap();

        broker.close_connections();
        settle().await;
        manager.acquire_channel().await.unwrap();

        tokio::time::advance(DEFAULT_RECONNECT_DELAY).await;
        settle().await;

        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn late_close_of_previous_connection_is_ignored() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await.unwrap();

        broker.close_connections();
        settle().await;
        manager.acquire_channel().await.unwrap();
        tokio::time::advance(DEFAULT_RECONNECT_DELAY).await;
        settle().await;
        assert_eq!(broker.connect_count(), 2);

        // Fires the first connection's hook after the second one is up.
        broker.replay_close_hooks();
        settle().await;
        assert!(manager.is_ready().await);

        tokio::time::advance(DEFAULT_RECONNECT_DELAY * 2).await;
        settle().await;

        assert!(manager.is_ready().await);
        assert_eq!(broker.connect_count(), 2);
        assert_eq!(manager.inner.reconnects.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_closed_by_broker_is_replaced_on_the_same_connection() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await.unwrap();

        broker.close_channels();
        assert!(!manager.is_ready().await);

        let channel = manager.acquire_channel().await.unwrap();
        channel
            .publish("news_indexing", b"{}", &MessageHeaders::default())
            .await
            .unwrap();

        assert!(manager.is_ready().await);
        assert_eq!(broker.connect_count(), 1);
        assert_eq!(broker.queue_depth("news_indexing"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_is_replaced_by_the_next_caller() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await.unwrap();

        // No settle: the close hook has not been processed yet.
        broker.close_connections();
        manager.acquire_channel().await.unwrap();

        assert!(manager.is_ready().await);
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_reconnects_and_refuses_callers() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await.unwrap();

        manager.close().await;
        broker.close_connections();
        tokio::time::advance(DEFAULT_RECONNECT_DELAY * 2).await;
        settle().await;

        assert_eq!(broker.connect_count(), 1);
        assert_eq!(
            manager.acquire_channel().await.err(),
            Some(AmqpError::ManagerClosed)
        );
    }
}
