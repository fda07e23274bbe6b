// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local implementation of the broker traits for tests and local
//! development without RabbitMQ. It is not meant for production traffic. It
//! keeps the AMQP behaviours the pipeline relies on:
//!
//! - queues must be declared before they receive messages, and re-declaring
//!   with a different durability is refused
//! - consumers receive at most `prefetch` unacknowledged deliveries per channel
//! - nacked messages are either requeued at the head or discarded
//! - closing a connection (from either side) returns its unacknowledged
//!   deliveries to their queues and ends its consumers
//!
//! Failure injection (`set_available`, `close_connections`, `close_channels`,
//! `cancel_consumers`, `replay_close_hooks`) lets tests drive the reconnect
//! and cancellation paths.
//!
//! The published and settlement histories keep only the most recent
//! `history_limit` entries.

use crate::{
    broker::{
        Acker, Broker, BrokerChannel, BrokerConnection, CloseHook, Delivery, DeliveryStream,
        MessageHeaders,
    },
    errors::AmqpError,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Entries kept in the published and settlement histories by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

type SharedHook = Arc<dyn Fn(AmqpError) + Send + Sync>;

/// A message as it was handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub headers: MessageHeaders,
}

/// How a delivery was settled by its consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Default)]
struct State {
    unavailable: bool,
    connect_delay: Option<Duration>,
    connects: usize,
    next_id: u64,
    next_tag: u64,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    consumers: HashMap<u64, ConsumerState>,
    history_limit: usize,
    published: VecDeque<PublishedMessage>,
    settlements: VecDeque<(u64, Settlement)>,
}

struct QueueState {
    durable: bool,
    ready: VecDeque<PublishedMessage>,
    unacked: BTreeMap<u64, (u64, PublishedMessage)>,
}

struct ConnectionState {
    open: bool,
    /// Kept after firing so a late notification can be replayed.
    hooks: Vec<SharedHook>,
}

struct ChannelState {
    connection: u64,
    open: bool,
    prefetch: u16,
    unacked: usize,
}

struct ConsumerState {
    channel: u64,
    queue: String,
    cancelled: bool,
}

enum Polled {
    Delivered(u64, PublishedMessage),
    Pending,
    Ended,
}

impl State {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel: u64) -> bool {
        self.channels.get(&channel).is_some_and(|c| c.open)
    }

    fn connection_open(&self, connection: u64) -> bool {
        self.connections.get(&connection).is_some_and(|c| c.open)
    }

    /// Marks a connection and its channels closed and hands back the hooks
    /// that have to fire.
    fn shutdown_connection(&mut self, connection: u64) -> Vec<SharedHook> {
        let hooks = match self.connections.get_mut(&connection) {
            Some(conn) if conn.open => {
                conn.open = false;
                conn.hooks.clone()
            }
            _ => return vec![],
        };

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection && c.open)
            .map(|(id, _)| *id)
            .collect();

        for channel in channels {
            self.shutdown_channel(channel);
        }

        hooks
    }

    fn shutdown_channel(&mut self, channel: u64) {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.open = false;
            state.unacked = 0;
        }

        for queue in self.queues.values_mut() {
            let returned: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == channel)
                .map(|(tag, _)| *tag)
                .collect();

            // Oldest tag ends up at the head.
            for tag in returned.into_iter().rev() {
                if let Some((_, msg)) = queue.unacked.remove(&tag) {
                    queue.ready.push_front(msg);
                }
            }
        }
    }

    fn poll_delivery(&mut self, consumer: u64) -> Polled {
        let Some(cons) = self.consumers.get(&consumer) else {
            return Polled::Ended;
        };
        if cons.cancelled || !self.channel_open(cons.channel) {
            return Polled::Ended;
        }

        let (channel_id, queue_name) = (cons.channel, cons.queue.clone());
        let Some(channel) = self.channels.get(&channel_id) else {
            return Polled::Ended;
        };
        if channel.prefetch > 0 && channel.unacked >= usize::from(channel.prefetch) {
            return Polled::Pending;
        }

        let Some(queue) = self.queues.get_mut(&queue_name) else {
            return Polled::Ended;
        };
        let Some(msg) = queue.ready.pop_front() else {
            return Polled::Pending;
        };

        self.next_tag += 1;
        let tag = self.next_tag;
        queue.unacked.insert(tag, (channel_id, msg.clone()));
        if let Some(channel) = self.channels.get_mut(&channel_id) {
            channel.unacked += 1;
        }

        Polled::Delivered(tag, msg)
    }

    fn settle(&mut self, queue: &str, channel: u64, tag: u64, how: Settlement) -> bool {
        if !self.channel_open(channel) {
            return false;
        }
        let Some(state) = self.queues.get_mut(queue) else {
            return false;
        };
        let Some((_, msg)) = state.unacked.remove(&tag) else {
            return false;
        };

        if let Settlement::Nack { requeue: true } = how {
            state.ready.push_front(msg);
        }
        if let Some(channel) = self.channels.get_mut(&channel) {
            channel.unacked = channel.unacked.saturating_sub(1);
        }
        let limit = self.history_limit;
        push_bounded(&mut self.settlements, (tag, how), limit);
        true
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, item: T, limit: usize) {
    history.push_back(item);
    while history.len() > limit {
        history.pop_front();
    }
}

/// In-memory message broker; clones share the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Keeps at most `limit` entries in `published` and `settlements`.
    pub fn with_history_limit(limit: usize) -> Self {
        let shared = Shared::default();
        shared.lock().history_limit = limit;
        InMemoryBroker {
            shared: Arc::new(shared),
        }
    }

    /// When unavailable, every connection attempt fails.
    pub fn set_available(&self, available: bool) {
        self.shared.lock().unavailable = !available;
    }

    /// Makes each connection attempt take `delay` before resolving.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.shared.lock().connect_delay = delay;
    }

    /// Number of connection attempts received so far.
    pub fn connect_count(&self) -> usize {
        self.shared.lock().connects
    }

    /// Closes every open connection from the broker side, firing their close
    /// hooks.
    pub fn close_connections(&self) {
        let hooks = {
            let mut state = self.shared.lock();
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, c)| c.open)
                .map(|(id, _)| *id)
                .collect();
            open.into_iter()
                .flat_map(|id| state.shutdown_connection(id))
                .collect::<Vec<_>>()
        };
        self.shared.notify.notify_waiters();

        debug!(hooks = hooks.len(), "broker closed connections");
        for hook in hooks {
            hook(AmqpError::ConnectionClosed(
                "connection closed by broker".to_owned(),
            ));
        }
    }

    /// Closes every open channel from the broker side, as a channel-level
    /// error would. Connections stay open and no hooks fire.
    pub fn close_channels(&self) {
        {
            let mut state = self.shared.lock();
            let open: Vec<u64> = state
                .channels
                .iter()
                .filter(|(_, c)| c.open)
                .map(|(id, _)| *id)
                .collect();
            for id in open {
                state.shutdown_channel(id);
            }
        }
        self.shared.notify.notify_waiters();
    }

    /// Fires the close hooks of already closed connections again, the way a
    /// late or duplicated notification would arrive.
    pub fn replay_close_hooks(&self) {
        let hooks: Vec<SharedHook> = self
            .shared
            .lock()
            .connections
            .values()
            .filter(|c| !c.open)
            .flat_map(|c| c.hooks.iter().cloned())
            .collect();

        debug!(hooks = hooks.len(), "replaying close hooks");
        for hook in hooks {
            hook(AmqpError::ConnectionClosed(
                "connection closed by broker".to_owned(),
            ));
        }
    }

    /// Simulates a broker restart: connections are dropped and non-durable
    /// queues disappear with their messages.
    pub fn restart(&self) {
        self.close_connections();
        self.shared.lock().queues.retain(|_, q| q.durable);
    }

    /// Cancels every consumer on `queue`; their streams end.
    pub fn cancel_consumers(&self, queue: &str) {
        {
            let mut state = self.shared.lock();
            for consumer in state.consumers.values_mut() {
                if consumer.queue == queue {
                    consumer.cancelled = true;
                }
            }
        }
        self.shared.notify.notify_waiters();
    }

    /// Messages accepted by `publish`, oldest first, up to the history limit.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.lock().published.iter().cloned().collect()
    }

    /// Messages published to `queue`, in order.
    pub fn published_to(&self, queue: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.queue == queue)
            .collect()
    }

    /// Messages waiting for delivery on `queue`.
    pub fn ready_messages(&self, queue: &str) -> Vec<PublishedMessage> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliveries on `queue` not yet acked or nacked.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or_default()
    }

    /// Ready plus unacknowledged messages on `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or_default()
    }

    /// Durability of `queue`, or `None` when it was never declared.
    pub fn queue_durable(&self, queue: &str) -> Option<bool> {
        self.shared.lock().queues.get(queue).map(|q| q.durable)
    }

    /// Live subscriptions on `queue`.
    pub fn active_consumers(&self, queue: &str) -> usize {
        let state = self.shared.lock();
        state
            .consumers
            .values()
            .filter(|c| c.queue == queue && !c.cancelled && state.channel_open(c.channel))
            .count()
    }

    /// Settlements in the order consumers issued them, up to the history
    /// limit.
    pub fn settlements(&self) -> Vec<Settlement> {
        self.shared
            .lock()
            .settlements
            .iter()
            .map(|(_, s)| *s)
            .collect()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let delay = {
            let mut state = self.shared.lock();
            state.connects += 1;
            state.connect_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.shared.lock();
        if state.unavailable {
            return Err(AmqpError::ConnectionError("broker unavailable".to_owned()));
        }

        let id = state.id();
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                hooks: vec![],
            },
        );

        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.shared.lock();
        if !state.connection_open(self.id) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let id = state.id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                prefetch: 0,
                unacked: 0,
            },
        );

        Ok(Arc::new(MemoryChannel {
            shared: self.shared.clone(),
            id,
        }))
    }

    fn on_close(&self, hook: CloseHook) {
        if let Some(conn) = self.shared.lock().connections.get_mut(&self.id) {
            conn.hooks.push(Arc::from(hook));
        }
    }

    fn is_open(&self) -> bool {
        self.shared.lock().connection_open(self.id)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        // Client-initiated close does not fire the close hooks.
        drop(self.shared.lock().shutdown_connection(self.id));
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    id: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &State) -> Result<(), AmqpError> {
        if state.channel_open(self.id) {
            Ok(())
        } else {
            Err(AmqpError::ConnectionClosed("channel is closed".to_owned()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;

        match state.queues.get(def.name()) {
            Some(existing) if existing.durable != def.is_durable() => {
                warn!(queue = def.name(), "queue redeclared with different durability");
                Err(AmqpError::DeclareQueueError(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name().to_owned(),
                    QueueState {
                        durable: def.is_durable(),
                        ready: VecDeque::new(),
                        unacked: BTreeMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)
            .map_err(|e| AmqpError::QoSDeclarationError(e.to_string()))?;

        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        headers: &MessageHeaders,
    ) -> Result<(), AmqpError> {
        {
            let mut state = self.shared.lock();
            self.ensure_open(&state)
                .map_err(|e| AmqpError::PublishingError(e.to_string()))?;

            let msg = PublishedMessage {
                queue: queue.to_owned(),
                payload: payload.to_vec(),
                headers: headers.clone(),
            };
            let limit = state.history_limit;
            push_bounded(&mut state.published, msg.clone(), limit);

            // Unroutable messages are dropped, as with the AMQP default exchange.
            match state.queues.get_mut(queue) {
                Some(q) => q.ready.push_back(msg),
                None => warn!(queue = queue, "message published to undeclared queue"),
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = {
            let mut state = self.shared.lock();
            self.ensure_open(&state)
                .map_err(|_| AmqpError::BindingConsumerError(queue.to_owned()))?;
            if !state.queues.contains_key(queue) {
                return Err(AmqpError::BindingConsumerError(queue.to_owned()));
            }

            let id = state.id();
            state.consumers.insert(
                id,
                ConsumerState {
                    channel: self.id,
                    queue: queue.to_owned(),
                    cancelled: false,
                },
            );
            id
        };

        let subscription = Subscription {
            shared: self.shared.clone(),
            channel: self.id,
            consumer,
            queue: queue.to_owned(),
        };

        Ok(stream::unfold(subscription, |sub| async move {
            let delivery = sub.next_delivery().await?;
            Some((Ok(delivery), sub))
        })
        .boxed())
    }

    fn is_open(&self) -> bool {
        self.shared.lock().channel_open(self.id)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.shared.lock().shutdown_channel(self.id);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct Subscription {
    shared: Arc<Shared>,
    channel: u64,
    consumer: u64,
    queue: String,
}

impl Subscription {
    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            let notified = self.shared.notify.notified();

            let polled = self.shared.lock().poll_delivery(self.consumer);
            match polled {
                Polled::Delivered(tag, msg) => {
                    return Some(Delivery::new(
                        tag,
                        msg.payload,
                        msg.headers,
                        Box::new(MemoryAcker {
                            shared: self.shared.clone(),
                            channel: self.channel,
                            queue: self.queue.clone(),
                            tag,
                        }),
                    ))
                }
                Polled::Ended => return None,
                Polled::Pending => notified.await,
            }
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    channel: u64,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, how: Settlement) -> bool {
        let settled = self
            .shared
            .lock()
            .settle(&self.queue, self.channel, self.tag, how);
        self.shared.notify.notify_waiters();
        settled
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        if self.settle(Settlement::Ack) {
            Ok(())
        } else {
            Err(AmqpError::AckMessageError)
        }
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.settle(Settlement::Nack { requeue }) {
            Ok(())
        } else {
            Err(AmqpError::NackMessageError)
        }
    }
}
