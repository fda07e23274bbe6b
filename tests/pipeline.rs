// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use news_indexer::{
    channel::ConnectionManager,
    dispatcher::{IndexingWorker, WorkerExit, DEFAULT_PREFETCH},
    errors::IndexError,
    indexer::{InMemoryIndex, SearchIndex},
    memory::{InMemoryBroker, Settlement},
    publisher::NewsPublisher,
    queue::QueueDefinition,
    record::QueuedRecord,
    retry::RetryPolicy,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

fn record(id: i64, content: &str) -> QueuedRecord {
    QueuedRecord {
        id,
        title: "T".to_owned(),
        content: content.to_owned(),
        author: "X".to_owned(),
        img_url: None,
        created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
    }
}

/// Index wrapper that fails or stalls on demand and records every call.
#[derive(Clone)]
struct ScriptedIndex {
    inner: InMemoryIndex,
    broker: InMemoryBroker,
    calls: Arc<Mutex<Vec<i64>>>,
    /// Settlements already issued when each call started.
    settled_at_start: Arc<Mutex<Vec<(i64, usize)>>>,
    failures: Arc<Mutex<HashMap<i64, usize>>>,
    delays: Arc<Mutex<HashMap<i64, Duration>>>,
}

impl ScriptedIndex {
    fn new(broker: &InMemoryBroker) -> Self {
        ScriptedIndex {
            inner: InMemoryIndex::new(),
            broker: broker.clone(),
            calls: Arc::default(),
            settled_at_start: Arc::default(),
            failures: Arc::default(),
            delays: Arc::default(),
        }
    }

    fn fail_times(&self, id: i64, times: usize) {
        self.failures.lock().unwrap().insert(id, times);
    }

    fn stall(&self, id: i64, delay: Duration) {
        self.delays.lock().unwrap().insert(id, delay);
    }

    fn calls(&self) -> Vec<i64> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchIndex for ScriptedIndex {
    async fn ensure_index_exists(&self) -> Result<(), IndexError> {
        self.inner.ensure_index_exists().await
    }

    async fn index_document(&self, record: &QueuedRecord) -> Result<(), IndexError> {
        self.calls.lock().unwrap().push(record.id);
        self.settled_at_start
            .lock()
            .unwrap()
            .push((record.id, self.broker.settlements().len()));

        let delay = self.delays.lock().unwrap().get(&record.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&record.id) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            return Err(IndexError::index("search engine unavailable"));
        }

        self.inner.index_document(record).await
    }

    async fn check_connectivity(&self) -> bool {
        true
    }
}

struct Pipeline {
    broker: InMemoryBroker,
    index: ScriptedIndex,
    publisher: NewsPublisher,
    worker: Arc<IndexingWorker>,
    shutdown: watch::Sender<bool>,
    running: JoinHandle<WorkerExit>,
}

impl Pipeline {
    fn start(queue: QueueDefinition) -> Pipeline {
        let broker = InMemoryBroker::new();
        let index = ScriptedIndex::new(&broker);

        // The write path owns its own connection.
        let publisher = NewsPublisher::new(ConnectionManager::new(
            Arc::new(broker.clone()),
            queue.clone(),
            RECONNECT_DELAY,
        ));

        let worker = Arc::new(IndexingWorker::new(
            ConnectionManager::new(Arc::new(broker.clone()), queue, RECONNECT_DELAY),
            Arc::new(index.clone()),
            RetryPolicy::default(),
            DEFAULT_PREFETCH,
        ));

        let (shutdown, rx) = watch::channel(false);
        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });

        Pipeline {
            broker,
            index,
            publisher,
            worker,
            shutdown,
            running,
        }
    }

    fn retry_headers(&self) -> Vec<Option<i64>> {
        self.broker
            .published_to("news_indexing")
            .into_iter()
            .map(|m| m.headers.retry_count)
            .collect()
    }

    async fn stop(self) -> WorkerExit {
        // Fails only when `run` already returned and dropped its receiver.
        let _ = self.shutdown.send(true);
        let exit = self.running.await.unwrap();
        self.worker.shutdown().await;
        exit
    }
}

/// Lets the paused runtime fire due timers and run woken tasks.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn published_record_is_indexed_without_retries() {
    let pipeline = Pipeline::start(QueueDefinition::default());
    settle().await;

    pipeline.publisher.publish(&record(1, "C")).await.unwrap();
    settle().await;

    let doc = pipeline.index.inner.get(1).unwrap();
    assert_eq!(doc.title, "T");
    assert_eq!(doc.content, "C");
    assert_eq!(doc.author, "X");
    assert_eq!(pipeline.index.calls(), vec![1]);
    assert_eq!(pipeline.retry_headers(), vec![None]);
    assert_eq!(pipeline.broker.settlements(), vec![Settlement::Ack]);
    assert_eq!(pipeline.broker.queue_depth("news_indexing"), 0);

    assert_eq!(pipeline.stop().await, WorkerExit::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn record_failing_twice_is_indexed_on_third_attempt() {
    let pipeline = Pipeline::start(QueueDefinition::default().with_dlq());
    pipeline.index.fail_times(1, 2);
    settle().await;

    pipeline.publisher.publish(&record(1, "C")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(pipeline.index.calls(), vec![1, 1, 1]);
    assert_eq!(pipeline.retry_headers(), vec![None, Some(1), Some(2)]);
    assert!(pipeline.index.inner.get(1).is_some());
    assert!(pipeline.broker.published_to("news_indexing-dlq").is_empty());
    assert_eq!(pipeline.broker.queue_depth("news_indexing"), 0);
    assert_eq!(pipeline.worker.pending_retries(), 0);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn always_failing_record_is_applied_max_retries_plus_one_times() {
    let pipeline = Pipeline::start(QueueDefinition::default().with_dlq());
    pipeline.index.fail_times(9, usize::MAX);
    settle().await;

    pipeline.publisher.publish(&record(9, "C")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(pipeline.index.calls().len(), 4);
    // Each redelivery carries exactly one more than the one before.
    assert_eq!(
        pipeline.retry_headers(),
        vec![None, Some(1), Some(2), Some(3)]
    );
    assert!(pipeline.index.inner.get(9).is_none());

    let dead = pipeline.broker.ready_messages("news_indexing-dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(QueuedRecord::from_slice(&dead[0].payload).unwrap().id, 9);
    assert_eq!(pipeline.broker.queue_depth("news_indexing"), 0);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn retries_wait_base_delay_times_attempt() {
    let pipeline = Pipeline::start(QueueDefinition::default());
    pipeline.index.fail_times(2, usize::MAX);
    settle().await;

    pipeline.publisher.publish(&record(2, "C")).await.unwrap();
    settle().await;
    assert_eq!(pipeline.index.calls().len(), 1);

    tokio::time::advance(Duration::from_millis(4_990)).await;
    settle().await;
    assert_eq!(pipeline.index.calls().len(), 1);

    tokio::time::advance(Duration::from_millis(10)).await;
    settle().await;
    assert_eq!(pipeline.index.calls().len(), 2);

    tokio::time::advance(Duration::from_millis(9_990)).await;
    settle().await;
    assert_eq!(pipeline.index.calls().len(), 2);

    tokio::time::advance(Duration::from_millis(10)).await;
    settle().await;
    assert_eq!(pipeline.index.calls().len(), 3);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn second_message_waits_for_first_to_be_settled() {
    let pipeline = Pipeline::start(QueueDefinition::default());
    pipeline.index.stall(1, Duration::from_secs(2));
    settle().await;

    pipeline.publisher.publish(&record(1, "A")).await.unwrap();
    pipeline.publisher.publish(&record(2, "B")).await.unwrap();
    settle().await;

    assert_eq!(pipeline.index.calls(), vec![1]);
    assert_eq!(pipeline.broker.unacked_count("news_indexing"), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(pipeline.index.calls(), vec![1, 2]);
    let starts = pipeline.index.settled_at_start.lock().unwrap().clone();
    assert_eq!(starts, vec![(1, 0), (2, 1)]);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_message_does_not_block_the_queue() {
    let pipeline = Pipeline::start(QueueDefinition::default());
    settle().await;

    pipeline.publisher.publish_json(b"{not json").await.unwrap();
    pipeline.publisher.publish(&record(3, "C")).await.unwrap();
    settle().await;

    assert!(pipeline.index.inner.get(3).is_some());
    assert_eq!(pipeline.worker.pending_retries(), 1);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn same_id_published_twice_keeps_latest_content() {
    let pipeline = Pipeline::start(QueueDefinition::default());
    settle().await;

    pipeline.publisher.publish(&record(5, "first")).await.unwrap();
    pipeline.publisher.publish(&record(5, "second")).await.unwrap();
    settle().await;

    assert_eq!(pipeline.index.inner.len(), 1);
    assert_eq!(pipeline.index.inner.get(5).unwrap().content, "second");

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn publish_and_consume_recover_within_reconnect_delay() {
    let pipeline = Pipeline::start(QueueDefinition::default());
    settle().await;

    pipeline.broker.set_available(false);
    pipeline.broker.close_connections();
    settle().await;
    assert!(pipeline.publisher.publish(&record(6, "C")).await.is_err());
    assert_eq!(pipeline.broker.active_consumers("news_indexing"), 0);

    pipeline.broker.set_available(true);
    tokio::time::advance(RECONNECT_DELAY).await;
    settle().await;

    pipeline.publisher.publish(&record(6, "C")).await.unwrap();
    settle().await;

    assert!(pipeline.index.inner.get(6).is_some());
    assert_eq!(pipeline.broker.active_consumers("news_indexing"), 1);
    assert!(!pipeline.running.is_finished());

    assert_eq!(pipeline.stop().await, WorkerExit::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn worker_keeps_consuming_after_connection_loss() {
    let pipeline = Pipeline::start(QueueDefinition::default());
    settle().await;

    pipeline.broker.close_connections();
    tokio::time::advance(RECONNECT_DELAY).await;
    pipeline.publisher.publish(&record(11, "C")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(pipeline.index.inner.get(11).unwrap().content, "C");
    assert_eq!(pipeline.broker.active_consumers("news_indexing"), 1);
    assert_eq!(pipeline.broker.queue_depth("news_indexing"), 0);
    assert!(!pipeline.running.is_finished());

    assert_eq!(pipeline.stop().await, WorkerExit::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn broker_cancel_ends_consumption() {
    let pipeline = Pipeline::start(QueueDefinition::default());
    settle().await;

    pipeline.broker.cancel_consumers("news_indexing");
    settle().await;

    assert!(pipeline.running.is_finished());
    assert_eq!(pipeline.broker.active_consumers("news_indexing"), 0);

    assert_eq!(pipeline.stop().await, WorkerExit::ConsumerCancelled);
}

#[tokio::test(start_paused = true)]
async fn graceful_shutdown_returns_unacked_message_to_queue() {
    let pipeline = Pipeline::start(QueueDefinition::default());
    pipeline.index.stall(7, Duration::from_secs(30));
    settle().await;

    pipeline.publisher.publish(&record(7, "C")).await.unwrap();
    settle().await;
    assert_eq!(pipeline.broker.unacked_count("news_indexing"), 1);

    let broker = pipeline.broker.clone();
    assert_eq!(pipeline.stop().await, WorkerExit::Shutdown);

    assert_eq!(broker.unacked_count("news_indexing"), 0);
    assert_eq!(broker.ready_messages("news_indexing").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn queues_survive_broker_restart() {
    let pipeline = Pipeline::start(QueueDefinition::default().with_dlq());
    settle().await;

    pipeline.broker.restart();

    assert_eq!(pipeline.broker.queue_durable("news_indexing"), Some(true));
    assert_eq!(pipeline.broker.queue_durable("news_indexing-dlq"), Some(true));

    pipeline.stop().await;
}
